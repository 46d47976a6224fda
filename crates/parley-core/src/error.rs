//! Flow error types.

use crate::context::SessionId;
use crate::log::{ExecutionStatus, LogId};
use crate::step::{FlowId, StepId};
use crate::traits::RoleId;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or executing a dialogue flow.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FlowError {
    /// The step graph is malformed. Raised at load time, never mid-run.
    #[error("Invalid flow definition: {0}")]
    Definition(String),

    /// An expression referenced a missing variable or produced a value of
    /// the wrong type.
    #[error("Condition '{expression}' could not be evaluated: {details}")]
    ConditionEvaluation {
        /// Source text of the expression.
        expression: String,
        /// What went wrong.
        details: String,
    },

    /// A generation call failed. Transient; retried per policy.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// A generation call exceeded its deadline.
    #[error("Generation timed out after {}ms", .0.as_millis())]
    GenerationTimeout(Duration),

    /// A loop reached its iteration cap. The engine treats this as a
    /// normal loop exit.
    #[error("Loop '{step_id}' reached its bound of {max_iterations} iterations")]
    LoopBoundExceeded {
        /// The loop step.
        step_id: StepId,
        /// The configured cap.
        max_iterations: u32,
    },

    /// The role provider does not know the requested role.
    #[error("Role not found: {0}")]
    RoleNotFound(RoleId),

    /// A referenced step is not part of the graph.
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    /// No flow definition is stored under the id.
    #[error("Flow not found: {0}")]
    FlowNotFound(FlowId),

    /// No session is stored under the id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// A log entry was asked to move backwards through its state machine.
    #[error("Invalid status transition for log entry {log_id}: {from} -> {to}")]
    InvalidTransition {
        /// The offending entry.
        log_id: LogId,
        /// Current status.
        from: ExecutionStatus,
        /// Requested status.
        to: ExecutionStatus,
    },

    /// A second attempt of a step, or a second run of a session, was
    /// started while the first is still running.
    #[error("Already running: {0}")]
    ConcurrentExecution(String),

    /// Engine configuration is invalid.
    #[error("Invalid engine configuration: {0}")]
    Configuration(String),

    /// The persistence collaborator failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl FlowError {
    /// Returns `true` for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlowError::Generation(_))
    }

    pub(crate) fn condition(expression: impl Into<String>, details: impl Into<String>) -> Self {
        FlowError::ConditionEvaluation {
            expression: expression.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = FlowError::condition("len(last_message) > 10", "no messages yet");
        assert_eq!(
            error.to_string(),
            "Condition 'len(last_message) > 10' could not be evaluated: no messages yet"
        );

        let timeout = FlowError::GenerationTimeout(Duration::from_millis(1500));
        assert_eq!(timeout.to_string(), "Generation timed out after 1500ms");
    }

    #[test]
    fn test_transition_display() {
        let error = FlowError::InvalidTransition {
            log_id: LogId::new(7),
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            error.to_string(),
            "Invalid status transition for log entry 7: completed -> running"
        );
    }

    #[test]
    fn test_only_generation_errors_are_transient() {
        assert!(FlowError::Generation("503".into()).is_transient());
        assert!(!FlowError::GenerationTimeout(Duration::from_secs(1)).is_transient());
        assert!(!FlowError::RoleNotFound(RoleId::new("critic")).is_transient());
    }
}
