//! Identifiers, capabilities and the op/event protocol spoken over the service channel

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Codebase, ErrorReport};
use crate::session::{DebugResult, DebugSession, StageOutcome};

/// Identity of a debugging session.
///
/// System-generated ids are UUIDv4 strings; callers may also supply their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates an [`Op`] with the events it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an agent can do. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "propose_architecture")]
    Architecture,
    #[serde(rename = "generate_code")]
    CodeGeneration,
    #[serde(rename = "write_tests")]
    TestWriting,
    #[serde(rename = "review")]
    Review,
}

impl Capability {
    /// The fixed four-stage pipeline
    pub const PIPELINE: [Capability; 4] = [
        Capability::Architecture,
        Capability::CodeGeneration,
        Capability::TestWriting,
        Capability::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Architecture => "propose_architecture",
            Capability::CodeGeneration => "generate_code",
            Capability::TestWriting => "write_tests",
            Capability::Review => "review",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a client can send to a [`DebugService`](crate::channel::DebugService)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Start debugging; answered with `SessionStarted` and eventually `SessionFinished`
    SubmitDebug {
        sub_id: SubmissionId,
        error: ErrorReport,
        codebase: Codebase,
    },
    /// Poll a session; answered with `SessionSnapshot`
    GetSession {
        sub_id: SubmissionId,
        session_id: SessionId,
    },
    /// Probe every registered agent; answered with `AgentHealth`
    CheckAgents { sub_id: SubmissionId },
    /// Cancel a running session
    CancelSession {
        sub_id: SubmissionId,
        session_id: SessionId,
    },
}

impl Op {
    pub fn sub_id(&self) -> &SubmissionId {
        match self {
            Op::SubmitDebug { sub_id, .. }
            | Op::GetSession { sub_id, .. }
            | Op::CheckAgents { sub_id }
            | Op::CancelSession { sub_id, .. } => sub_id,
        }
    }

    pub fn submit(error: ErrorReport, codebase: Codebase) -> Self {
        Op::SubmitDebug {
            sub_id: SubmissionId::new(),
            error,
            codebase,
        }
    }

    pub fn get_session(session_id: SessionId) -> Self {
        Op::GetSession {
            sub_id: SubmissionId::new(),
            session_id,
        }
    }

    pub fn check_agents() -> Self {
        Op::CheckAgents {
            sub_id: SubmissionId::new(),
        }
    }

    pub fn cancel(session_id: SessionId) -> Self {
        Op::CancelSession {
            sub_id: SubmissionId::new(),
            session_id,
        }
    }
}

/// Events emitted by the coordinator and the service loop.
///
/// Pipeline events carry no submission id; they are keyed by session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted {
        session_id: SessionId,
        sub_id: Option<SubmissionId>,
    },
    StageStarted {
        session_id: SessionId,
        capability: Capability,
        agent_name: String,
    },
    StageFinished {
        session_id: SessionId,
        capability: Capability,
        agent_name: String,
        outcome: StageOutcome,
    },
    SessionFinished { result: DebugResult },
    SessionSnapshot {
        sub_id: SubmissionId,
        session: DebugSession,
    },
    AgentHealth {
        sub_id: SubmissionId,
        statuses: BTreeMap<String, bool>,
    },
    SessionCancelled {
        sub_id: SubmissionId,
        session_id: SessionId,
        cancelled: bool,
    },
    Error {
        sub_id: SubmissionId,
        message: String,
    },
}
