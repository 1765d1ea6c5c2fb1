//! genrelay CLI Library
//!
//! HTTP client for the relay daemon, an incremental SSE decoder, and a
//! follower that keeps a response stream alive across disconnects.

pub mod client;
pub mod follow;
pub mod render;
pub mod sse;
