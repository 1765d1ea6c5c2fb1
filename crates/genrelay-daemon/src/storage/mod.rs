//! `SQLite` storage for genrelay transcripts.
//!
//! Provides persistence for sessions and their messages.

mod db;
mod models;
mod queries;
mod store;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use store::TranscriptStore;
