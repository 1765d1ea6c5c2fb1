//! Subprocess management for Claude Code processes.

pub mod bridge;
pub mod manager;

pub use bridge::{EventBridge, ResultSummary};
pub use manager::{
    ClaudeProcess, Conversation, PermissionStrategy, SpawnConfig, SubprocessError,
    SubprocessManager,
};
