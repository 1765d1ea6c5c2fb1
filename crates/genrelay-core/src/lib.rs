//! genrelay Core Library
//!
//! Shared functionality for genrelay components:
//! - Relay event model and wire names
//! - NDJSON framing and decoding for the Claude stream-json protocol
//! - Configuration resolution and hierarchy
//! - HTTP request/response bodies shared by daemon and CLI
//! - Client-side resume contract (cursor de-duplication, epochs)
//! - Common error types

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod ndjson;
pub mod resume;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventPayload, RelayEvent, ResponseStatus};
