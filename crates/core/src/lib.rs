//! `searchsync-core`: identifiers and error primitives shared by the
//! indexing worker crates.
//!
//! No infrastructure concerns live here.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, SubjectId};
