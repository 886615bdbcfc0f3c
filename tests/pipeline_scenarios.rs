use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cabal_debug::{
    Agent, AgentCoordinator, AgentExecutionError, AgentRegistry, ArchitectureAgent, Capability,
    Codebase, CodeGeneratorAgent, CoordinatorConfig, DebugResult, DebugSession, ErrorReport,
    FixKind, JsonFileStore, ReviewerAgent, SessionStatus, SessionStore, StageOutcome,
    StageOutput, TestWriterAgent,
};
use tokio_test::assert_ok;

/// Agent whose health probe always fails
struct UnreachableAgent {
    capability: Capability,
}

#[async_trait]
impl Agent for UnreachableAgent {
    fn agent_name(&self) -> &str {
        "unreachable"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn execute(&self, _session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        Err(AgentExecutionError::Internal(anyhow::anyhow!("connection refused")))
    }
}

/// Agent that answers probes but takes too long to execute
struct SlowAgent {
    name: &'static str,
    capability: Capability,
    delay: Duration,
}

#[async_trait]
impl Agent for SlowAgent {
    fn agent_name(&self) -> &str {
        self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        tokio::time::sleep(self.delay).await;
        Ok(StageOutput::no_finding(session.analysis()))
    }

    async fn probe(&self) -> Result<(), AgentExecutionError> {
        Ok(())
    }
}

fn registry_with(replacement: Arc<dyn Agent>) -> AgentRegistry {
    let registry = AgentRegistry::new();
    let mut agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ArchitectureAgent::new()),
        Arc::new(CodeGeneratorAgent::new()),
        Arc::new(TestWriterAgent::new()),
        Arc::new(ReviewerAgent::new()),
    ];
    agents.retain(|a| a.capability() != replacement.capability());
    agents.push(replacement);
    for agent in agents {
        registry.register(agent).unwrap();
    }
    registry
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_stage_timeout(Duration::from_millis(100))
        .with_health_timeout(Duration::from_millis(500))
}

fn syntax_error() -> ErrorReport {
    ErrorReport::builder("SyntaxError", "unexpected token")
        .file_path("a.py")
        .line_number(10)
        .build()
        .unwrap()
}

fn codebase() -> Codebase {
    let source: String = (1..=12)
        .map(|n| if n == 10 { "def f(:\n".to_string() } else { format!("x{} = {}\n", n, n) })
        .collect();
    Codebase::new("demo")
        .with_language("python")
        .with_file("a.py", source)
}

#[tokio::test]
async fn full_pipeline_completes_syntax_error() {
    let coordinator = AgentCoordinator::with_defaults();

    let session = coordinator
        .handle_error(syntax_error(), codebase())
        .await
        .unwrap();

    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(!session.fixes().is_empty());
    assert!(session.fixes().iter().any(|f| f.kind == FixKind::CodeChange));
    assert!(session.fixes().iter().any(|f| f.kind == FixKind::RegressionTest));

    let outcomes: Vec<_> = session.stages().iter().map(|s| (s.capability, s.outcome.clone())).collect();
    assert_eq!(outcomes[0], (Capability::Architecture, StageOutcome::NoFinding));
    assert_eq!(outcomes[1].0, Capability::CodeGeneration);
    assert_eq!(outcomes[2].0, Capability::TestWriting);
    assert_eq!(outcomes[3].0, Capability::Review);
    assert!(session.analysis().contains("Review: approved"));

    let code_change = session
        .fixes()
        .iter()
        .find(|f| f.kind == FixKind::CodeChange)
        .unwrap();
    assert!(code_change.patch.as_deref().unwrap().contains("def f(:"));

    let result = coordinator.result(session.id()).unwrap();
    assert!(result.success);
    assert_eq!(result.fixes, session.fixes());
}

#[tokio::test]
async fn unavailable_code_generator_fails_before_dispatch() {
    let registry = registry_with(Arc::new(UnreachableAgent {
        capability: Capability::CodeGeneration,
    }));
    let coordinator = AgentCoordinator::new(registry, fast_config()).unwrap();

    let session = coordinator
        .handle_error(syntax_error(), codebase())
        .await
        .unwrap();

    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(session.fixes().is_empty());
    assert!(session
        .analysis()
        .contains("No agent available for stage generate_code"));
    assert!(!coordinator.result(session.id()).unwrap().success);
}

#[tokio::test]
async fn stage_timeout_keeps_earlier_fixes() {
    let registry = registry_with(Arc::new(SlowAgent {
        name: "slow-writer",
        capability: Capability::TestWriting,
        delay: Duration::from_secs(5),
    }));
    let coordinator = AgentCoordinator::new(registry, fast_config()).unwrap();

    let session = coordinator
        .handle_error(syntax_error(), codebase())
        .await
        .unwrap();

    assert_eq!(session.status(), SessionStatus::Failed);
    assert_eq!(session.fixes().len(), 1);
    assert_eq!(session.fixes()[0].kind, FixKind::CodeChange);
    assert!(session
        .stages()
        .iter()
        .any(|s| s.capability == Capability::TestWriting && s.outcome == StageOutcome::TimedOut));
    assert!(session.analysis().contains("timed out"));

    let result = DebugResult::from_session(&session).unwrap();
    assert!(!result.success);
    assert_eq!(result.fixes.len(), 1);
}

#[tokio::test]
async fn concurrent_sessions_stay_independent() {
    let coordinator = AgentCoordinator::with_defaults();

    let key_error = ErrorReport::builder("KeyError", "'user'")
        .file_path("users.py")
        .line_number(3)
        .build()
        .unwrap();

    let (first, second) = tokio::join!(
        coordinator.handle_error(syntax_error(), codebase()),
        coordinator.handle_error(key_error, Codebase::new("svc")),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_ne!(first.id(), second.id());
    assert!(first.is_terminal() && second.is_terminal());
    assert!(first
        .fixes()
        .iter()
        .all(|f| f.file_path.as_deref().is_some_and(|p| p.ends_with("a.py"))));
    assert!(second
        .fixes()
        .iter()
        .all(|f| f.file_path.as_deref().is_some_and(|p| p.ends_with("users.py"))));
    assert!(coordinator.session_ids().is_empty());
    assert_eq!(coordinator.get_session(first.id()).unwrap(), first);
    assert_eq!(coordinator.get_session(second.id()).unwrap(), second);
}

#[tokio::test]
async fn many_parallel_submissions_terminate() {
    let coordinator = Arc::new(AgentCoordinator::with_defaults());

    let mut ids = Vec::new();
    for n in 0..8 {
        let error = ErrorReport::builder("IndexError", format!("index {} out of range", n))
            .file_path(format!("mod_{}.py", n))
            .build()
            .unwrap();
        ids.push(coordinator.submit(error, Codebase::new("svc")).unwrap());
    }

    for id in &ids {
        let session = coordinator.wait(id).await.unwrap();
        assert!(session.is_terminal());
        let stem = session.error().file_path().unwrap().trim_end_matches(".py");
        assert!(!session.fixes().is_empty());
        assert!(session
            .fixes()
            .iter()
            .all(|f| f.file_path.as_deref().is_some_and(|p| p.contains(stem))));
    }
}

#[tokio::test]
async fn cancellation_fails_session_without_partial_stage() {
    let registry = registry_with(Arc::new(SlowAgent {
        name: "slow-coder",
        capability: Capability::CodeGeneration,
        delay: Duration::from_secs(30),
    }));
    let config = fast_config().with_stage_timeout(Duration::from_secs(60));
    let coordinator = Arc::new(AgentCoordinator::new(registry, config).unwrap());

    let id = coordinator.submit(syntax_error(), codebase()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let polled = coordinator.get_session(&id).unwrap();
    assert_eq!(polled.status(), SessionStatus::InProgress);

    assert!(coordinator.cancel(&id).unwrap());
    let session = coordinator.wait(&id).await.unwrap();

    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(session.fixes().is_empty());
    assert!(session.analysis().contains("cancelled"));
    assert!(session
        .stages()
        .iter()
        .any(|s| s.outcome == StageOutcome::Cancelled));

    assert!(!coordinator.cancel(&id).unwrap());
}

#[tokio::test]
async fn terminal_session_rejects_mutation() {
    let coordinator = AgentCoordinator::with_defaults();
    let mut session = coordinator
        .handle_error(syntax_error(), codebase())
        .await
        .unwrap();
    let before = session.fixes().len();

    let fix = session.fixes()[0].clone();
    assert!(session.push_fix(fix).is_err());
    assert!(session.set_analysis("rewritten").is_err());
    assert_eq!(session.fixes().len(), before);

    let first = coordinator.result(session.id()).unwrap();
    let second = coordinator.result(session.id()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn sessions_and_results_persist_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let coordinator = AgentCoordinator::with_defaults().with_store(store);

    let session = coordinator
        .handle_error(syntax_error(), codebase())
        .await
        .unwrap();

    let reopened = JsonFileStore::open(dir.path()).unwrap();
    let stored = assert_ok!(reopened.load_session(session.id())).unwrap();
    assert_eq!(stored, session);

    let result = assert_ok!(reopened.load_result(session.id())).unwrap();
    assert!(result.success);
    assert_eq!(result.session_id, *session.id());
}
