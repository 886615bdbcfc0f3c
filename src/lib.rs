//! # Cabal Debug
//!
//! Agent coordination and debugging-session lifecycle engine.
//!
//! A caller submits an [`ErrorReport`] and the [`Codebase`] it happened in.
//! The [`AgentCoordinator`] opens a [`DebugSession`], runs it through a fixed
//! four-stage pipeline of specialized agents, and ends it `completed` or
//! `failed`. A [`DebugResult`] snapshot is derived once the session terminates.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         AGENT COORDINATOR                         │
//! │  ┌──────────────┐   ┌────────────────┐   ┌────────────────────┐   │
//! │  │ Agent        │   │ Health probes  │   │ Session store      │   │
//! │  │ Registry     │   │ (verify_agent) │   │ (by session id)    │   │
//! │  └──────────────┘   └────────────────┘   └────────────────────┘   │
//! └─────────────────────────────┬─────────────────────────────────────┘
//!                               │ one pipeline per session
//!                               ▼
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//!   │ Architecture │──▶│ Code         │──▶│ Test         │──▶│ Review   │
//!   │              │   │ Generation   │   │ Writing      │   │          │
//!   └──────────────┘   └──────────────┘   └──────────────┘   └──────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: performs one pipeline stage; failures are recoverable
//! - **Session**: one debugging attempt, `in_progress` until terminal, frozen after
//! - **Stage**: one step of the pipeline, with a timeout and at most one fallback agent
//! - **Result**: immutable summary of a terminated session

pub mod agent;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod protocol;
pub mod session;
pub mod store;

pub use agent::{
    Agent, AgentRegistry, ArchitectureAgent, CodeGeneratorAgent, ReviewerAgent, TestWriterAgent,
};
pub use channel::{ChannelPair, CoordinatorChannel, DebugService};
pub use config::CoordinatorConfig;
pub use coordinator::AgentCoordinator;
pub use error::{AgentExecutionError, CoordinatorError, StoreError};
pub use model::{Codebase, ContextValue, ErrorContext, ErrorReport, FixKind, FixRecord};
pub use protocol::{Capability, Event, Op, SessionId, SubmissionId};
pub use session::{
    DebugResult, DebugSession, SessionHandle, SessionStatus, StageOutcome, StageOutput,
    StageRecord, StageVerdict,
};
pub use store::{JsonFileStore, MemoryStore, SessionStore};
