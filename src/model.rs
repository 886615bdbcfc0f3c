//! Value objects: the failure being debugged, the code it happened in, and proposed fixes

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::protocol::Capability;

/// A single context value attached to an error report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Integer(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

/// Context key reserved for [`ErrorContext::extra`]
pub const EXTRA_CONTEXT_KEY: &str = "extra";

/// Structured context entries plus an unstructured escape hatch.
///
/// On the wire this is a flat object: every key except `extra` is a typed entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(flatten)]
    pub entries: BTreeMap<String, ContextValue>,
    /// Data that does not fit the typed entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.extra.is_none()
    }
}

/// The failure a debugging session works on. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    error_type: String,
    message: String,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default, skip_serializing_if = "ErrorContext::is_empty")]
    context: ErrorContext,
}

impl ErrorReport {
    /// Start building a report
    pub fn builder(error_type: impl Into<String>, message: impl Into<String>) -> ErrorReportBuilder {
        ErrorReportBuilder {
            report: ErrorReport {
                error_type: error_type.into(),
                message: message.into(),
                file_path: None,
                line_number: None,
                traceback: None,
                context: ErrorContext::default(),
            },
        }
    }

    pub(crate) fn canary() -> Self {
        ErrorReport {
            error_type: "SyntaxError".into(),
            message: "canary probe".into(),
            file_path: Some("canary.py".into()),
            line_number: Some(1),
            traceback: None,
            context: ErrorContext::default(),
        }
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    pub fn line_number(&self) -> Option<u32> {
        self.line_number
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Reject reports that cannot start a session.
    ///
    /// Deserialized reports bypass the builder, so the coordinator calls this on every input.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.error_type.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("error_type is empty".into()));
        }
        if self.message.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("message is empty".into()));
        }
        if matches!(self.file_path.as_deref(), Some(p) if p.trim().is_empty()) {
            return Err(CoordinatorError::InvalidInput("file_path is empty".into()));
        }
        if self.context.entries.contains_key(EXTRA_CONTEXT_KEY) {
            return Err(CoordinatorError::InvalidInput(format!(
                "context key '{}' is reserved",
                EXTRA_CONTEXT_KEY
            )));
        }
        Ok(())
    }
}

/// Builder for [`ErrorReport`]
#[derive(Debug, Clone)]
pub struct ErrorReportBuilder {
    report: ErrorReport,
}

impl ErrorReportBuilder {
    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.report.file_path = Some(path.into());
        self
    }

    pub fn line_number(mut self, line: u32) -> Self {
        self.report.line_number = Some(line);
        self
    }

    pub fn traceback(mut self, traceback: impl Into<String>) -> Self {
        self.report.traceback = Some(traceback.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.report.context.entries.insert(key.into(), value.into());
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.report.context.extra = Some(extra);
        self
    }

    pub fn build(self) -> Result<ErrorReport, CoordinatorError> {
        self.report.validate()?;
        Ok(self.report)
    }
}

/// Reference to a project's source snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Codebase {
    pub name: String,
    #[serde(default)]
    pub root: PathBuf,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Optional file contents keyed by path relative to `root`
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Codebase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// 1-based line lookup in the snapshot
    pub fn line(&self, path: &str, line_number: u32) -> Option<&str> {
        let idx = usize::try_from(line_number).ok()?.checked_sub(1)?;
        self.files.get(path)?.lines().nth(idx)
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.name.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("codebase name is empty".into()));
        }
        Ok(())
    }
}

/// What a fix record changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    Architecture,
    CodeChange,
    RegressionTest,
}

/// One proposed or applied change, appended to a session by an agent stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub id: Uuid,
    pub agent_name: String,
    pub capability: Capability,
    pub kind: FixKind,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub description: String,
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl FixRecord {
    pub fn new(
        agent_name: impl Into<String>,
        capability: Capability,
        kind: FixKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            capability,
            kind,
            file_path: None,
            line_number: None,
            description: description.into(),
            patch: None,
            extra: None,
        }
    }

    pub fn at(mut self, file_path: impl Into<String>, line_number: Option<u32>) -> Self {
        self.file_path = Some(file_path.into());
        self.line_number = line_number;
        self
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        self.patch = Some(patch.into());
        self
    }
}
