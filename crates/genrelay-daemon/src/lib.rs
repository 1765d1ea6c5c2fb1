//! genrelay daemon library
//!
//! Core functionality for the genrelay daemon:
//! - Session locks allowing one generation per session
//! - Subprocess management for `claude` processes
//! - In-memory response registry with replayable event logs
//! - SQLite transcript storage
//! - HTTP/SSE server for browser and CLI clients

pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;
pub mod subprocess;
