//! Error types for the agent world runtime.
//!
//! Mirrors the plain-enum-plus-manual-`Display` style the rest of this codebase uses for
//! its error types (see `OrchestrationError` in the orchestration-flavoured parts of the
//! original toolkit): no external derive-macro crate, just `std::error::Error`.

use std::fmt;

/// Errors surfaced by the public world/agent/chat/storage APIs.
///
/// Input-validation failures and invariant violations both flow through this enum; callers
/// distinguish them by variant rather than by a separate "kind" field, matching how the rest
/// of the crate favours explicit variants over generic wrapper types.
#[derive(Debug)]
pub enum WorldError {
    /// No world is registered under the given id.
    WorldNotFound(String),
    /// No agent is registered under the given id within the world.
    AgentNotFound(String),
    /// No chat is registered under the given id within the world.
    ChatNotFound(String),
    /// A message failed a structural invariant (missing id, self-referential reply, etc).
    InvalidMessage(String),
    /// `Storage::save_agent` rejected a save because memory entries lacked a `message_id`.
    MissingMessageIds { agent_id: String, count: usize },
    /// The underlying storage backend failed.
    Storage(String),
    /// The configured provider adapter failed (timeout, quota, malformed stream, ...).
    Provider(String),
    /// A tool invocation could not be dispatched (unknown tool, ownership violation, ...).
    Tool(String),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::WorldNotFound(id) => write!(f, "world not found: {id}"),
            WorldError::AgentNotFound(id) => write!(f, "agent not found: {id}"),
            WorldError::ChatNotFound(id) => write!(f, "chat not found: {id}"),
            WorldError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            WorldError::MissingMessageIds { agent_id, count } => write!(
                f,
                "refusing to save agent '{agent_id}': {count} memory entr{} missing message_id",
                if *count == 1 { "y" } else { "ies" }
            ),
            WorldError::Storage(msg) => write!(f, "storage error: {msg}"),
            WorldError::Provider(msg) => write!(f, "provider error: {msg}"),
            WorldError::Tool(msg) => write!(f, "tool error: {msg}"),
        }
    }
}

impl std::error::Error for WorldError {}

/// Convenience alias used throughout the crate's fallible public APIs.
pub type WorldResult<T> = Result<T, WorldError>;
