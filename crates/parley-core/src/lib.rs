//! Core types and collaborator traits for the parley dialogue flow engine.
//!
//! This crate holds everything that does not need an async runtime.
//! Storage backends and generation vendors depend on this crate to plug
//! into the engine.
//!
//! # Core Types
//!
//! - [`StepGraph`] - Validated, read-only tree of flow steps
//! - [`Expression`] - Condition expressions evaluated against a session
//! - [`ExecutionContext`] - Per-session runtime state
//! - [`LoopController`] - Iteration counters for active loop steps
//! - [`StepExecution`] / [`ExecutionLog`] - Record of step-execution attempts
//! - [`TerminationRules`] - Global early-exit rules
//! - [`FlowVisualizationData`] - Read-model for monitoring consumers
//! - [`FlowError`] - Error taxonomy shared by every layer
//!
//! # Collaborators
//!
//! - [`RoleProvider`] - Resolves role prompts
//! - [`GenerationClient`] - Produces text for a dialogue turn
//! - [`Persistence`] - Stores flows, sessions and the execution log

/// Defines a string-backed identifier newtype.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

mod context;
mod error;
mod expression;
mod graph;
mod log;
mod loops;
mod retry;
mod session;
mod step;
mod termination;
mod traits;
mod visualization;

pub use context::{ExecutionContext, Message, SessionId, SessionStatus, SUMMARY_LIMIT};
pub use error::FlowError;
pub use expression::{Expression, ExpressionError};
pub use graph::{FlowBuilder, FlowDefinition, StepGraph};
pub use log::{
    DialoguePayload, ExecutionLog, ExecutionStatus, LogId, ResultType, StepExecution,
};
pub use loops::LoopController;
pub use retry::{RetryPolicy, RetryPolicyError};
pub use session::{NewSession, SessionFailure, SessionRecord};
pub use step::{
    ConditionConfig, ContextPolicy, DialogueConfig, FlowId, JoinPolicy, LoopConfig,
    ParallelConfig, RoleAssignment, Step, StepId, StepKind, StepType,
};
pub use termination::{TerminationReason, TerminationRules};
pub use traits::{GenerationClient, GenerationRequest, Persistence, Role, RoleId, RoleProvider};
pub use visualization::{ExecutionSummary, FlowVisualizationData, StepNode};
