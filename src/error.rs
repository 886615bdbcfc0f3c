//! Coordinator error types

use thiserror::Error;

use crate::protocol::{Capability, SessionId};
use crate::session::SessionStatus;

/// Errors surfaced to callers of the coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Malformed error report or codebase, rejected before a session exists
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Mutation attempted on a session that is already terminal
    #[error("Session {session_id} is {status} and cannot be modified")]
    InvalidSessionState {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// No operational agent for a mandatory stage
    #[error("No agent available for stage {0}")]
    NoAgentAvailable(Capability),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Result requested for a session still in progress
    #[error("Session {0} has not terminated")]
    SessionNotTerminal(SessionId),

    /// A pipeline is already running against the session
    #[error("Session {0} already has an active pipeline")]
    PipelineActive(SessionId),

    /// Agent name registered twice
    #[error("Duplicate agent name: {0}")]
    DuplicateAgent(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel error
    #[error("Channel is closed")]
    ChannelClosed,
}

/// Recoverable failure reported by an agent.
///
/// The coordinator absorbs these into session state; they never reach callers.
/// "No fix found" is not an error and is returned as a [`StageOutput`](crate::session::StageOutput).
#[derive(Debug, Error)]
pub enum AgentExecutionError {
    /// The agent cannot continue with this session
    #[error("Cannot proceed: {0}")]
    CannotProceed(String),

    /// The agent does not handle this error type at all
    #[error("Agent {agent} does not support error type {error_type}")]
    Unsupported { agent: String, error_type: String },

    /// Anything else that went wrong inside the agent
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors from a session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A result for the session was already written
    #[error("Result already recorded for session {0}")]
    ResultExists(SessionId),
}
