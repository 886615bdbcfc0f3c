//! Debugging session state machine and result derivation

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoordinatorError;
use crate::model::{Codebase, ErrorReport, FixRecord};
use crate::protocol::{Capability, SessionId};

/// Lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How an agent wants the pipeline to proceed after its stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageVerdict {
    /// Stage contributed; run the next stage
    Continue,
    /// Nothing found for this stage; run the next stage
    NoFinding,
    /// No further stage is needed
    Resolved,
}

/// What an agent hands back from `execute`. Committed to the session as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub fixes: Vec<FixRecord>,
    /// Replaces the session analysis when present
    pub analysis: Option<String>,
    pub verdict: StageVerdict,
}

impl StageOutput {
    pub fn proceed(fixes: Vec<FixRecord>, analysis: impl Into<String>) -> Self {
        Self {
            fixes,
            analysis: Some(analysis.into()),
            verdict: StageVerdict::Continue,
        }
    }

    pub fn no_finding(analysis: impl Into<String>) -> Self {
        Self {
            fixes: Vec::new(),
            analysis: Some(analysis.into()),
            verdict: StageVerdict::NoFinding,
        }
    }

    pub fn resolved(analysis: impl Into<String>) -> Self {
        Self {
            fixes: Vec::new(),
            analysis: Some(analysis.into()),
            verdict: StageVerdict::Resolved,
        }
    }
}

/// What happened to one stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Committed { fixes_added: usize },
    NoFinding,
    Resolved,
    /// Every agent for the stage failed its health check
    Unavailable,
    Failed { reason: String },
    TimedOut,
    Cancelled,
}

impl StageOutcome {
    /// Whether the attempt counts as a stage failure
    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. } | StageOutcome::TimedOut)
    }
}

/// Entry in a session's stage log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub capability: Capability,
    pub agent_name: Option<String>,
    pub outcome: StageOutcome,
    pub at: DateTime<Utc>,
}

/// One debugging attempt, from creation to completion or failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSession {
    id: SessionId,
    error: ErrorReport,
    status: SessionStatus,
    codebase: Codebase,
    fixes: Vec<FixRecord>,
    analysis: String,
    #[serde(default)]
    stages: Vec<StageRecord>,
    #[serde(default)]
    retry_of: Option<SessionId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DebugSession {
    pub fn new(id: SessionId, error: ErrorReport, codebase: Codebase) -> Self {
        let now = Utc::now();
        Self {
            id,
            error,
            status: SessionStatus::InProgress,
            codebase,
            fixes: Vec::new(),
            analysis: String::new(),
            stages: Vec::new(),
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Throwaway session used by health probes
    pub fn canary() -> Self {
        let error = ErrorReport::canary();
        let codebase = Codebase::new("canary").with_file("canary.py", "print(\n");
        Self::new(SessionId::from("canary"), error, codebase)
    }

    pub(crate) fn with_retry_of(mut self, previous: SessionId) -> Self {
        self.retry_of = Some(previous);
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn error(&self) -> &ErrorReport {
        &self.error
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn codebase(&self) -> &Codebase {
        &self.codebase
    }

    pub fn fixes(&self) -> &[FixRecord] {
        &self.fixes
    }

    pub fn analysis(&self) -> &str {
        &self.analysis
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn retry_of(&self) -> Option<&SessionId> {
        self.retry_of.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn ensure_in_progress(&self) -> Result<(), CoordinatorError> {
        if self.status.is_terminal() {
            warn!(session_id = %self.id, status = %self.status, "Mutation attempted on terminal session");
            return Err(CoordinatorError::InvalidSessionState {
                session_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a fix
    pub fn push_fix(&mut self, fix: FixRecord) -> Result<(), CoordinatorError> {
        self.ensure_in_progress()?;
        self.fixes.push(fix);
        self.touch();
        Ok(())
    }

    /// Replace the analysis text
    pub fn set_analysis(&mut self, analysis: impl Into<String>) -> Result<(), CoordinatorError> {
        self.ensure_in_progress()?;
        self.analysis = analysis.into();
        self.touch();
        Ok(())
    }

    /// Log a stage attempt that produced no output
    pub fn record_stage(
        &mut self,
        capability: Capability,
        agent_name: Option<String>,
        outcome: StageOutcome,
    ) -> Result<(), CoordinatorError> {
        self.ensure_in_progress()?;
        self.stages.push(StageRecord {
            capability,
            agent_name,
            outcome,
            at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Commit an agent's stage output in one step
    pub fn commit_stage(
        &mut self,
        capability: Capability,
        agent_name: &str,
        output: StageOutput,
    ) -> Result<StageOutcome, CoordinatorError> {
        self.ensure_in_progress()?;

        let outcome = match output.verdict {
            StageVerdict::Resolved => StageOutcome::Resolved,
            StageVerdict::NoFinding if output.fixes.is_empty() => StageOutcome::NoFinding,
            _ => StageOutcome::Committed {
                fixes_added: output.fixes.len(),
            },
        };

        self.fixes.extend(output.fixes);
        if let Some(analysis) = output.analysis {
            self.analysis = analysis;
        }
        self.stages.push(StageRecord {
            capability,
            agent_name: Some(agent_name.to_string()),
            outcome: outcome.clone(),
            at: Utc::now(),
        });
        self.touch();

        debug!(session_id = %self.id, capability = %capability, fixes = self.fixes.len(), "Stage committed");
        Ok(outcome)
    }

    /// Transition to `Completed`
    pub fn complete(&mut self) -> Result<(), CoordinatorError> {
        self.ensure_in_progress()?;
        self.status = SessionStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Transition to `Failed`, appending the reason to the analysis
    pub fn fail(&mut self, reason: impl AsRef<str>) -> Result<(), CoordinatorError> {
        self.ensure_in_progress()?;
        let reason = reason.as_ref();
        if self.analysis.is_empty() {
            self.analysis = reason.to_string();
        } else {
            self.analysis = format!("{}\n{}", self.analysis, reason);
        }
        self.status = SessionStatus::Failed;
        self.touch();
        Ok(())
    }
}

/// Immutable summary of a terminated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugResult {
    pub session_id: SessionId,
    pub error: ErrorReport,
    pub fixes: Vec<FixRecord>,
    pub analysis: String,
    pub success: bool,
}

impl DebugResult {
    /// Snapshot a terminated session. Fails if it is still in progress.
    pub fn from_session(session: &DebugSession) -> Result<Self, CoordinatorError> {
        if !session.is_terminal() {
            return Err(CoordinatorError::SessionNotTerminal(session.id.clone()));
        }
        Ok(Self {
            session_id: session.id.clone(),
            error: session.error.clone(),
            fixes: session.fixes.clone(),
            analysis: session.analysis.clone(),
            success: session.status == SessionStatus::Completed,
        })
    }
}

/// Shared handle to a live session
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<RwLock<DebugSession>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    pipeline: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(session: DebugSession) -> Self {
        let (status_tx, _) = watch::channel(session.status());
        Self {
            state: Arc::new(RwLock::new(session)),
            status_tx: Arc::new(status_tx),
            pipeline: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.read().id.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> DebugSession {
        self.state.read().clone()
    }

    /// Mutate under the write lock and publish the resulting status
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut DebugSession) -> Result<R, CoordinatorError>,
    ) -> Result<R, CoordinatorError> {
        let (result, status) = {
            let mut guard = self.state.write();
            let result = f(&mut guard);
            (result, guard.status)
        };
        self.status_tx.send_replace(status);
        result
    }

    /// Claim the session's single pipeline slot
    pub fn begin_pipeline(&self) -> Result<OwnedMutexGuard<()>, CoordinatorError> {
        Arc::clone(&self.pipeline)
            .try_lock_owned()
            .map_err(|_| CoordinatorError::PipelineActive(self.id()))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fire the cancel token unless the session already terminated.
    ///
    /// Decided under the state lock, so a `true` here always ends the session `failed`.
    pub fn request_cancel(&self) -> bool {
        let guard = self.state.write();
        if guard.status.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait until the session is terminal
    pub async fn wait_terminal(&self) -> DebugSession {
        let mut rx = self.status_tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        self.snapshot()
    }
}
