//! Infrastructure for keeping the search index in sync with the record store.

pub mod config;
pub mod jobs;
pub mod projector;
pub mod search;
