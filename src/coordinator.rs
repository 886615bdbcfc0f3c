//! Agent coordinator - health checks and the debugging pipeline

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{Agent, AgentRegistry};
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::model::{Codebase, ErrorReport};
use crate::protocol::{Capability, Event, SessionId, SubmissionId};
use crate::session::{
    DebugResult, DebugSession, SessionHandle, StageOutcome, StageVerdict,
};
use crate::store::{MemoryStore, SessionStore};

/// How the pipeline continues after a stage
#[derive(Debug)]
enum StageFlow {
    Continue,
    Resolved,
    Failed(String),
    Cancelled,
}

/// One planned stage: the capability and the agents to try, primary first
struct PlannedStage {
    capability: Capability,
    agents: Vec<Arc<dyn Agent>>,
}

/// Owns the agent registry and runs debugging sessions through the pipeline.
///
/// Each session runs its stages sequentially; independent sessions run concurrently.
pub struct AgentCoordinator {
    registry: Arc<AgentRegistry>,
    config: CoordinatorConfig,
    /// Live sessions
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    store: Arc<dyn SessionStore>,
    event_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl AgentCoordinator {
    /// Create a coordinator over `registry`, backed by an in-memory store
    pub fn new(registry: AgentRegistry, config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
            config,
            sessions: RwLock::new(HashMap::new()),
            store: Arc::new(MemoryStore::new()),
            event_tx: None,
        })
    }

    /// Coordinator with the built-in agents and default config
    pub fn with_defaults() -> Self {
        Self {
            registry: Arc::new(AgentRegistry::with_defaults()),
            config: CoordinatorConfig::default(),
            sessions: RwLock::new(HashMap::new()),
            store: Arc::new(MemoryStore::new()),
            event_tx: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Emit pipeline events on `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<Event>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Save a snapshot; returns whether the store accepted it
    fn persist(&self, session: &DebugSession) -> bool {
        match self.store.save_session(session) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Failed to persist session");
                false
            }
        }
    }

    /// Probe one agent. Errors, panics and timeouts all report `false`.
    pub async fn verify_agent(&self, agent: &Arc<dyn Agent>) -> bool {
        let name = agent.agent_name().to_string();
        let probe_agent = Arc::clone(agent);
        let mut task = tokio::spawn(async move { probe_agent.probe().await });

        match tokio::time::timeout(self.config.health_timeout(), &mut task).await {
            Ok(Ok(Ok(()))) => {
                debug!(agent = %name, "Agent healthy");
                true
            }
            Ok(Ok(Err(e))) => {
                warn!(agent = %name, error = %e, "Agent probe failed");
                false
            }
            Ok(Err(e)) => {
                warn!(agent = %name, error = %e, "Agent probe panicked");
                false
            }
            Err(_) => {
                task.abort();
                warn!(agent = %name, timeout_ms = self.config.health_timeout_ms, "Agent probe timed out");
                false
            }
        }
    }

    /// Probe every registered agent concurrently
    pub async fn agent_health(&self) -> BTreeMap<String, bool> {
        let agents = self.registry.all();
        let checks = agents.iter().map(|agent| async move {
            (agent.agent_name().to_string(), self.verify_agent(agent).await)
        });
        join_all(checks).await.into_iter().collect()
    }

    fn open_session(
        &self,
        id: SessionId,
        error: ErrorReport,
        codebase: Codebase,
        retry_of: Option<SessionId>,
        sub_id: Option<SubmissionId>,
    ) -> Result<SessionHandle, CoordinatorError> {
        error.validate()?;
        codebase.validate()?;
        if id.as_str().trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("session id is empty".into()));
        }

        let mut session = DebugSession::new(id.clone(), error, codebase);
        if let Some(previous) = retry_of {
            session = session.with_retry_of(previous);
        }

        let handle = SessionHandle::new(session.clone());
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(Self::id_in_use(&id));
            }
            sessions.insert(id.clone(), handle.clone());
        }

        // The id is reserved; store I/O happens outside the map lock.
        // Evicted sessions are always persisted first, so a finished id is still found here.
        if matches!(self.store.load_session(&id), Ok(Some(_))) {
            self.sessions.write().remove(&id);
            return Err(Self::id_in_use(&id));
        }
        self.persist(&session);

        info!(session_id = %id, error_type = session.error().error_type(), "Created debug session");
        self.emit(Event::SessionStarted {
            session_id: id,
            sub_id,
        });

        Ok(handle)
    }

    fn id_in_use(id: &SessionId) -> CoordinatorError {
        CoordinatorError::InvalidInput(format!("session id {} already in use", id))
    }

    fn live(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    /// Run the pipeline for a new session and return it terminal
    #[instrument(skip_all, fields(error_type = %error.error_type()))]
    pub async fn handle_error(
        &self,
        error: ErrorReport,
        codebase: Codebase,
    ) -> Result<DebugSession, CoordinatorError> {
        self.handle_error_with_id(SessionId::new(), error, codebase).await
    }

    /// Like [`handle_error`](Self::handle_error) with a caller-chosen session id
    pub async fn handle_error_with_id(
        &self,
        id: SessionId,
        error: ErrorReport,
        codebase: Codebase,
    ) -> Result<DebugSession, CoordinatorError> {
        let handle = self.open_session(id, error, codebase, None, None)?;
        self.run_pipeline(&handle).await?;
        Ok(handle.snapshot())
    }

    /// Run a session to completion and return its result
    pub async fn debug(
        &self,
        error: ErrorReport,
        codebase: Codebase,
    ) -> Result<DebugResult, CoordinatorError> {
        let session = self.handle_error(error, codebase).await?;
        self.result(session.id())
    }

    /// Start a session in the background and return its id for polling
    pub fn submit(
        self: &Arc<Self>,
        error: ErrorReport,
        codebase: Codebase,
    ) -> Result<SessionId, CoordinatorError> {
        self.submit_tracked(error, codebase, None)
    }

    pub(crate) fn submit_tracked(
        self: &Arc<Self>,
        error: ErrorReport,
        codebase: Codebase,
        sub_id: Option<SubmissionId>,
    ) -> Result<SessionId, CoordinatorError> {
        let handle = self.open_session(SessionId::new(), error, codebase, None, sub_id)?;
        let id = handle.id();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_pipeline(&handle).await {
                error!(session_id = %handle.id(), error = %e, "Pipeline aborted");
            }
        });
        Ok(id)
    }

    /// Start a fresh session for the same error and codebase as a terminal one
    #[instrument(skip(self))]
    pub async fn retry(&self, id: &SessionId) -> Result<DebugSession, CoordinatorError> {
        let previous = self.get_session(id)?;
        if !previous.is_terminal() {
            return Err(CoordinatorError::SessionNotTerminal(id.clone()));
        }

        let handle = self.open_session(
            SessionId::new(),
            previous.error().clone(),
            previous.codebase().clone(),
            Some(id.clone()),
            None,
        )?;
        info!(previous = %id, session_id = %handle.id(), "Retrying session");
        self.run_pipeline(&handle).await?;
        Ok(handle.snapshot())
    }

    /// Current state of a session, live or stored
    pub fn get_session(&self, id: &SessionId) -> Result<DebugSession, CoordinatorError> {
        if let Some(handle) = self.live(id) {
            return Ok(handle.snapshot());
        }
        self.store
            .load_session(id)?
            .ok_or_else(|| CoordinatorError::SessionNotFound(id.clone()))
    }

    /// Wait for a session to terminate
    pub async fn wait(&self, id: &SessionId) -> Result<DebugSession, CoordinatorError> {
        match self.live(id) {
            Some(handle) => Ok(handle.wait_terminal().await),
            None => self.get_session(id),
        }
    }

    /// Result of a terminated session
    pub fn result(&self, id: &SessionId) -> Result<DebugResult, CoordinatorError> {
        if let Some(result) = self.store.load_result(id)? {
            return Ok(result);
        }
        DebugResult::from_session(&self.get_session(id)?)
    }

    /// Request cancellation. Returns `false` when the session already terminated.
    ///
    /// A `true` return guarantees the session ends `failed`.
    pub fn cancel(&self, id: &SessionId) -> Result<bool, CoordinatorError> {
        let Some(handle) = self.live(id) else {
            return match self.store.load_session(id)? {
                Some(_) => Ok(false),
                None => Err(CoordinatorError::SessionNotFound(id.clone())),
            };
        };
        if !handle.request_cancel() {
            return Ok(false);
        }
        info!(session_id = %id, "Cancelling session");
        Ok(true)
    }

    /// Ids of sessions still held in memory. Finished sessions move to the store.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Decide which stages run and with which agents
    async fn plan(&self, handle: &SessionHandle) -> Result<Vec<PlannedStage>, CoordinatorError> {
        let mut plan = Vec::new();
        let attempts = 1 + usize::from(self.config.fallback_retries);

        for capability in Capability::PIPELINE {
            let candidates = self.registry.for_capability(capability);
            let agents: Vec<Arc<dyn Agent>> = if self.config.verify_before_dispatch {
                let healthy = join_all(candidates.iter().map(|a| self.verify_agent(a))).await;
                candidates
                    .into_iter()
                    .zip(healthy)
                    .filter_map(|(agent, ok)| ok.then_some(agent))
                    .collect()
            } else {
                candidates
            };

            if agents.is_empty() {
                handle.update(|s| s.record_stage(capability, None, StageOutcome::Unavailable))?;
                if self.config.is_mandatory(capability) {
                    return Err(CoordinatorError::NoAgentAvailable(capability));
                }
                debug!(capability = %capability, "Optional stage has no agent, skipping");
                continue;
            }

            plan.push(PlannedStage {
                capability,
                agents: agents.into_iter().take(attempts).collect(),
            });
        }

        Ok(plan)
    }

    /// Drive one session through its stages to a terminal state.
    ///
    /// Only invariant violations are returned as errors; agent failures,
    /// timeouts and cancellation end the session as `failed`.
    #[instrument(skip_all, fields(session_id = %handle.id()))]
    async fn run_pipeline(&self, handle: &SessionHandle) -> Result<(), CoordinatorError> {
        let _pipeline = handle.begin_pipeline()?;
        let cancel = handle.cancel_token().clone();

        let plan = match self.plan(handle).await {
            Ok(plan) => plan,
            Err(e @ CoordinatorError::NoAgentAvailable(_)) => {
                warn!(error = %e, "Session failed before dispatch");
                handle.update(|s| s.fail(e.to_string()))?;
                self.finish(handle);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for stage in &plan {
            if cancel.is_cancelled() {
                handle.update(|s| {
                    s.record_stage(stage.capability, None, StageOutcome::Cancelled)?;
                    s.fail("Session cancelled")
                })?;
                self.finish(handle);
                return Ok(());
            }

            match self.run_stage(handle, stage, &cancel).await? {
                StageFlow::Continue => {}
                StageFlow::Resolved => {
                    info!(capability = %stage.capability, "Stage resolved the session early");
                    break;
                }
                StageFlow::Failed(reason) => {
                    handle.update(|s| s.fail(&reason))?;
                    self.finish(handle);
                    return Ok(());
                }
                StageFlow::Cancelled => {
                    handle.update(|s| s.fail("Session cancelled"))?;
                    self.finish(handle);
                    return Ok(());
                }
            }
        }

        // A cancel that landed while the last stage was committing still wins
        handle.update(|s| {
            if cancel.is_cancelled() {
                s.fail("Session cancelled")
            } else {
                s.complete()
            }
        })?;
        self.finish(handle);
        Ok(())
    }

    /// Run one stage: the primary agent, then at most one fallback
    async fn run_stage(
        &self,
        handle: &SessionHandle,
        stage: &PlannedStage,
        cancel: &CancellationToken,
    ) -> Result<StageFlow, CoordinatorError> {
        let session_id = handle.id();
        let capability = stage.capability;
        let mut failures = Vec::new();

        for (attempt, agent) in stage.agents.iter().enumerate() {
            let agent_name = agent.agent_name().to_string();
            if attempt > 0 {
                info!(capability = %capability, agent = %agent_name, "Falling back to next agent");
            }
            self.emit(Event::StageStarted {
                session_id: session_id.clone(),
                capability,
                agent_name: agent_name.clone(),
            });

            let snapshot = handle.snapshot();
            let execution = tokio::time::timeout(self.config.stage_timeout(), agent.execute(&snapshot));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = execution => Some(result),
            };

            let outcome = match result {
                None => {
                    handle.update(|s| {
                        s.record_stage(capability, Some(agent_name.clone()), StageOutcome::Cancelled)
                    })?;
                    self.stage_finished(&session_id, capability, agent_name, StageOutcome::Cancelled);
                    return Ok(StageFlow::Cancelled);
                }
                Some(Ok(Ok(output))) => {
                    let resolved = output.verdict == StageVerdict::Resolved;
                    let outcome =
                        handle.update(|s| s.commit_stage(capability, &agent_name, output))?;
                    self.persist(&handle.snapshot());
                    self.stage_finished(&session_id, capability, agent_name, outcome);
                    return Ok(if resolved {
                        StageFlow::Resolved
                    } else {
                        StageFlow::Continue
                    });
                }
                Some(Ok(Err(e))) => {
                    warn!(capability = %capability, agent = %agent_name, error = %e, "Agent failed");
                    failures.push(format!("{} failed: {}", agent_name, e));
                    StageOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Some(Err(_)) => {
                    warn!(
                        capability = %capability,
                        agent = %agent_name,
                        timeout_ms = self.config.stage_timeout_ms,
                        "Agent timed out"
                    );
                    failures.push(format!(
                        "{} timed out after {}ms",
                        agent_name, self.config.stage_timeout_ms
                    ));
                    StageOutcome::TimedOut
                }
            };

            handle.update(|s| s.record_stage(capability, Some(agent_name.clone()), outcome.clone()))?;
            self.stage_finished(&session_id, capability, agent_name, outcome);
        }

        Ok(StageFlow::Failed(format!(
            "Stage {} failed: {}",
            capability,
            failures.join("; ")
        )))
    }

    fn stage_finished(
        &self,
        session_id: &SessionId,
        capability: Capability,
        agent_name: String,
        outcome: StageOutcome,
    ) {
        self.emit(Event::StageFinished {
            session_id: session_id.clone(),
            capability,
            agent_name,
            outcome,
        });
    }

    /// Persist the terminal session, record its result once, announce it.
    ///
    /// The live handle is dropped once the store holds the terminal snapshot.
    fn finish(&self, handle: &SessionHandle) {
        let session = handle.snapshot();
        let persisted = self.persist(&session);

        let result = match DebugResult::from_session(&session) {
            Ok(result) => result,
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "Finish called on live session");
                return;
            }
        };
        if let Err(e) = self.store.save_result(&result) {
            warn!(session_id = %session.id(), error = %e, "Failed to persist result");
        }

        info!(
            session_id = %session.id(),
            status = %session.status(),
            fixes = session.fixes().len(),
            "Debug session finished"
        );
        self.emit(Event::SessionFinished { result });

        if persisted {
            self.sessions.write().remove(session.id());
        }
    }
}
