//! Agents - the units that perform one pipeline stage each

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{AgentExecutionError, CoordinatorError};
use crate::model::{FixKind, FixRecord};
use crate::protocol::Capability;
use crate::session::{DebugSession, StageOutput};

/// A specialized worker for one pipeline stage.
///
/// Agents only read the session they are given. The coordinator commits the
/// returned [`StageOutput`]; agents never change session status.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique name within a registry
    fn agent_name(&self) -> &str;

    /// The stage this agent performs
    fn capability(&self) -> Capability;

    /// Run the stage against a session snapshot
    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError>;

    /// Health probe. The default runs `execute` against a canary session.
    async fn probe(&self) -> Result<(), AgentExecutionError> {
        let canary = DebugSession::canary();
        self.execute(&canary).await.map(|_| ())
    }
}

fn append_section(previous: &str, section: impl AsRef<str>) -> String {
    if previous.is_empty() {
        section.as_ref().to_string()
    } else {
        format!("{}\n{}", previous, section.as_ref())
    }
}

fn location(session: &DebugSession) -> String {
    let error = session.error();
    match (error.file_path(), error.line_number()) {
        (Some(path), Some(line)) => format!("{}:{}", path, line),
        (Some(path), None) => path.to_string(),
        _ => "unknown location".to_string(),
    }
}

const STRUCTURAL_ERRORS: &[&str] = &[
    "ImportError",
    "ModuleNotFoundError",
    "CircularImportError",
    "DependencyError",
];

const ENVIRONMENTAL_ERRORS: &[&str] = &["TimeoutError", "ConnectionError", "PermissionError"];

/// Process-level failures that no source edit addresses
const REFUSED_ERRORS: &[&str] = &["MemoryError", "KeyboardInterrupt", "SystemExit"];

/// Looks for structural causes: broken imports, dependency cycles
pub struct ArchitectureAgent {
    name: String,
}

impl ArchitectureAgent {
    pub fn new() -> Self {
        Self::named("architect")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ArchitectureAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ArchitectureAgent {
    fn agent_name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Architecture
    }

    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        let error = session.error();
        if !STRUCTURAL_ERRORS.contains(&error.error_type()) {
            debug!(agent = %self.name, error_type = error.error_type(), "No structural issue");
            return Ok(StageOutput::no_finding(append_section(
                session.analysis(),
                "Architecture: no structural issue found.",
            )));
        }

        let mut fix = FixRecord::new(
            &self.name,
            Capability::Architecture,
            FixKind::Architecture,
            format!(
                "Restructure module dependencies around {}: {}",
                location(session),
                error.message()
            ),
        );
        if let Some(path) = error.file_path() {
            fix = fix.at(path, error.line_number());
        }

        Ok(StageOutput::proceed(
            vec![fix],
            append_section(
                session.analysis(),
                format!("Architecture: {} indicates a dependency problem.", error.error_type()),
            ),
        ))
    }
}

/// Proposes code changes for common error families
pub struct CodeGeneratorAgent {
    name: String,
}

impl CodeGeneratorAgent {
    pub fn new() -> Self {
        Self::named("code-generator")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn remedy(error_type: &str) -> Option<&'static str> {
        let remedy = match error_type {
            "SyntaxError" | "IndentationError" => "Correct the malformed syntax",
            "NameError" | "UnboundLocalError" => "Define or import the missing name",
            "TypeError" => "Convert or validate the argument types",
            "AttributeError" => "Guard the attribute access against a missing value",
            "IndexError" | "KeyError" => "Check bounds or key presence before access",
            "ValueError" => "Validate the input before conversion",
            "ImportError" | "ModuleNotFoundError" => "Fix the import path",
            _ => return None,
        };
        Some(remedy)
    }
}

impl Default for CodeGeneratorAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for CodeGeneratorAgent {
    fn agent_name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::CodeGeneration
    }

    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        let error = session.error();

        if REFUSED_ERRORS.contains(&error.error_type()) {
            return Err(AgentExecutionError::Unsupported {
                agent: self.name.clone(),
                error_type: error.error_type().to_string(),
            });
        }

        if ENVIRONMENTAL_ERRORS.contains(&error.error_type()) {
            info!(agent = %self.name, error_type = error.error_type(), "Environmental failure, no code change");
            return Ok(StageOutput::resolved(append_section(
                session.analysis(),
                format!(
                    "Code generation: {} is environmental; no code change proposed.",
                    error.error_type()
                ),
            )));
        }

        let Some(path) = error.file_path() else {
            return Ok(StageOutput::no_finding(append_section(
                session.analysis(),
                "Code generation: error has no file location; no fix found.",
            )));
        };

        let Some(remedy) = Self::remedy(error.error_type()) else {
            return Ok(StageOutput::no_finding(append_section(
                session.analysis(),
                format!("Code generation: no automated fix for {}.", error.error_type()),
            )));
        };

        let mut fix = FixRecord::new(
            &self.name,
            Capability::CodeGeneration,
            FixKind::CodeChange,
            format!("{} at {}: {}", remedy, location(session), error.message()),
        )
        .at(path, error.line_number());

        if let Some(original) = error
            .line_number()
            .and_then(|line| session.codebase().line(path, line))
        {
            fix = fix.with_patch(format!(
                "--- {path}\n+++ {path}\n@@ line {} @@\n-{}\n",
                error.line_number().unwrap_or_default(),
                original
            ));
        }

        Ok(StageOutput::proceed(
            vec![fix],
            append_section(
                session.analysis(),
                format!("Code generation: proposed fix for {} in {}.", error.error_type(), path),
            ),
        ))
    }
}

/// Writes a regression test for every code change
pub struct TestWriterAgent {
    name: String,
}

impl TestWriterAgent {
    pub fn new() -> Self {
        Self::named("test-writer")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn test_path(source: &str) -> String {
        let path = Path::new(source);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source");
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("tests/test_{}.{}", stem, ext),
            None => format!("tests/test_{}", stem),
        }
    }

    fn test_name(error_type: &str) -> String {
        let mut name = String::from("test_regression");
        for c in error_type.chars() {
            if c.is_ascii_uppercase() {
                name.push('_');
                name.push(c.to_ascii_lowercase());
            } else if c.is_ascii_alphanumeric() {
                name.push(c);
            } else {
                name.push('_');
            }
        }
        name
    }
}

impl Default for TestWriterAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for TestWriterAgent {
    fn agent_name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::TestWriting
    }

    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        let test_name = Self::test_name(session.error().error_type());
        let tests: Vec<FixRecord> = session
            .fixes()
            .iter()
            .filter(|f| f.kind == FixKind::CodeChange)
            .filter_map(|f| f.file_path.as_deref().map(|p| (p, f.line_number)))
            .map(|(path, line)| {
                FixRecord::new(
                    &self.name,
                    Capability::TestWriting,
                    FixKind::RegressionTest,
                    format!("Add {} covering {}", test_name, path),
                )
                .at(Self::test_path(path), None)
                .with_patch(format!(
                    "{}: reproduce {} at {}{}",
                    test_name,
                    session.error().message(),
                    path,
                    line.map(|l| format!(":{}", l)).unwrap_or_default()
                ))
            })
            .collect();

        if tests.is_empty() {
            return Ok(StageOutput::no_finding(append_section(
                session.analysis(),
                "Tests: no code change to cover.",
            )));
        }

        let count = tests.len();
        Ok(StageOutput::proceed(
            tests,
            append_section(session.analysis(), format!("Tests: added {} regression test(s).", count)),
        ))
    }
}

/// Checks every proposed fix before the session completes
pub struct ReviewerAgent {
    name: String,
}

impl ReviewerAgent {
    pub fn new() -> Self {
        Self::named("reviewer")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn problems(session: &DebugSession) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen_code_change = false;
        for fix in session.fixes() {
            if fix.description.trim().is_empty() {
                problems.push(format!("fix {} has no description", fix.id));
            }
            match fix.kind {
                FixKind::CodeChange => {
                    seen_code_change = true;
                    if fix.file_path.is_none() {
                        problems.push(format!("code change {} has no file", fix.id));
                    }
                }
                FixKind::RegressionTest if !seen_code_change => {
                    problems.push(format!("test {} covers no code change", fix.id));
                }
                _ => {}
            }
        }
        problems
    }
}

impl Default for ReviewerAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ReviewerAgent {
    fn agent_name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Review
    }

    async fn execute(&self, session: &DebugSession) -> Result<StageOutput, AgentExecutionError> {
        let problems = Self::problems(session);
        if !problems.is_empty() {
            return Err(AgentExecutionError::CannotProceed(format!(
                "review rejected: {}",
                problems.join("; ")
            )));
        }

        let verdict = if session.fixes().is_empty() {
            "Review: no fixes proposed; nothing to approve.".to_string()
        } else {
            format!("Review: approved {} fix(es).", session.fixes().len())
        };
        Ok(StageOutput::proceed(Vec::new(), append_section(session.analysis(), verdict)))
    }
}

/// Registered agents keyed by the stage they perform.
///
/// Within a capability, registration order is fallback order.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<Capability, Vec<Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry with one built-in agent per capability
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let defaults: [Arc<dyn Agent>; 4] = [
            Arc::new(ArchitectureAgent::new()),
            Arc::new(CodeGeneratorAgent::new()),
            Arc::new(TestWriterAgent::new()),
            Arc::new(ReviewerAgent::new()),
        ];
        for agent in defaults {
            // Built-in names are distinct.
            let _ = registry.register(agent);
        }
        registry
    }

    /// Register an agent under its own capability
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<(), CoordinatorError> {
        let mut guard = self.agents.write();
        let name = agent.agent_name().to_string();
        if guard
            .values()
            .flatten()
            .any(|existing| existing.agent_name() == name)
        {
            return Err(CoordinatorError::DuplicateAgent(name));
        }

        info!(agent = %name, capability = %agent.capability(), "Registered agent");
        guard.entry(agent.capability()).or_default().push(agent);
        Ok(())
    }

    /// Agents for a capability, primary first
    pub fn for_capability(&self, capability: Capability) -> Vec<Arc<dyn Agent>> {
        self.agents
            .read()
            .get(&capability)
            .cloned()
            .unwrap_or_default()
    }

    /// Every registered agent in pipeline order
    pub fn all(&self) -> Vec<Arc<dyn Agent>> {
        self.agents.read().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
