//! Stored session records.

use crate::context::{SessionId, SessionStatus};
use crate::step::{FlowId, StepId};
use crate::traits::RoleId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The last failing step of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub step_id: StepId,
    pub error_message: String,
}

/// What the persistence collaborator keeps about a session besides its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub flow_id: FlowId,
    #[serde(default)]
    pub topic: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub current_step_id: Option<StepId>,
    /// Role references bound to concrete role ids.
    #[serde(default)]
    pub role_bindings: HashMap<String, RoleId>,
    /// Initial variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub last_error: Option<SessionFailure>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, flow_id: FlowId) -> Self {
        Self {
            session_id,
            flow_id,
            topic: None,
            status: SessionStatus::Pending,
            current_step_id: None,
            role_bindings: HashMap::new(),
            variables: HashMap::new(),
            last_error: None,
        }
    }

    /// Resolves a role reference through the session bindings.
    pub fn bound_role(&self, reference: &str) -> RoleId {
        self.role_bindings
            .get(reference)
            .cloned()
            .unwrap_or_else(|| RoleId::new(reference))
    }
}

/// Parameters for creating a session.
///
/// # Examples
///
/// ```
/// use parley_core::{FlowId, NewSession, SessionId};
///
/// let session = NewSession::new(SessionId::new("s-42"), FlowId::new("debate"))
///     .topic("Should cities ban cars?")
///     .bind_role("pro", "urbanist")
///     .variable("audience", "students");
/// let record = session.into_record();
/// assert_eq!(record.bound_role("pro").as_str(), "urbanist");
/// assert_eq!(record.bound_role("con").as_str(), "con");
/// ```
#[derive(Debug, Clone)]
pub struct NewSession {
    record: SessionRecord,
}

impl NewSession {
    pub fn new(session_id: impl Into<SessionId>, flow_id: impl Into<FlowId>) -> Self {
        Self {
            record: SessionRecord::new(session_id.into(), flow_id.into()),
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.record.topic = Some(topic.into());
        self
    }

    pub fn bind_role(mut self, reference: impl Into<String>, role: impl Into<RoleId>) -> Self {
        self.record.role_bindings.insert(reference.into(), role.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.record.variables.insert(name.into(), value.into());
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.record.session_id
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.record.flow_id
    }

    pub fn into_record(self) -> SessionRecord {
        self.record
    }
}
