//! Collaborator traits.
//!
//! The engine consumes three capabilities it does not implement: a role
//! directory, a text generator and a store.

use crate::context::{Message, SessionId, SessionStatus};
use crate::error::FlowError;
use crate::graph::FlowDefinition;
use crate::log::StepExecution;
use crate::session::{SessionFailure, SessionRecord};
use crate::step::{FlowId, StepId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

string_id!(
    /// Identifier of a role known to the [`RoleProvider`].
    RoleId
);

/// A speaking role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub prompt: String,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt: prompt.into(),
        }
    }
}

/// Resolves roles by id.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// # Errors
    ///
    /// [`FlowError::RoleNotFound`] if the id is unknown.
    async fn get_role(&self, role_id: &RoleId) -> Result<Role, FlowError>;
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Role prompt with the step's task and target folded in.
    pub role_prompt: String,
    pub messages: Vec<Message>,
    /// Deadline the engine enforces on this attempt.
    pub timeout: Duration,
    /// Retry cap the engine applies around this call.
    pub max_retries: u32,
}

/// Produces the text of one dialogue turn.
///
/// Implementations report transient failures as [`FlowError::Generation`]
/// and deadline overruns as [`FlowError::GenerationTimeout`]. The engine
/// enforces the deadline itself, so implementations may ignore
/// [`GenerationRequest::timeout`].
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, FlowError>;
}

/// Durable storage for flows, sessions and execution logs.
///
/// The execution log is a journal: every call to
/// [`append_execution_log`](Persistence::append_execution_log) adds one
/// version of an entry, and [`load_execution_log`](Persistence::load_execution_log)
/// returns all versions in the order they were appended.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_flow_definition(&self, flow_id: &FlowId) -> Result<FlowDefinition, FlowError>;

    async fn create_session(&self, record: SessionRecord) -> Result<(), FlowError>;

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, FlowError>;

    async fn update_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), FlowError>;

    async fn update_current_step(
        &self,
        session_id: &SessionId,
        step_id: &StepId,
    ) -> Result<(), FlowError>;

    async fn record_failure(
        &self,
        session_id: &SessionId,
        failure: SessionFailure,
    ) -> Result<(), FlowError>;

    async fn append_execution_log(&self, entry: &StepExecution) -> Result<(), FlowError>;

    async fn load_execution_log(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StepExecution>, FlowError>;
}
