//! In-memory persistence.

use async_trait::async_trait;
use parley_core::{
    FlowDefinition, FlowError, FlowId, Persistence, SessionFailure, SessionId, SessionRecord,
    SessionStatus, StepExecution, StepId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A [`Persistence`] implementation backed by process memory.
///
/// Clones share the same data, so two engines built on clones of one store
/// see each other's sessions. Useful for tests and single-process tools.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flows: RwLock<HashMap<FlowId, FlowDefinition>>,
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
    journals: RwLock<HashMap<SessionId, Vec<StepExecution>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces a flow definition.
    pub async fn insert_flow(&self, definition: FlowDefinition) {
        self.inner
            .flows
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }

    /// Number of journal writes for a session, counting every version.
    pub async fn journal_len(&self, session_id: &SessionId) -> usize {
        self.inner
            .journals
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }

    async fn with_session<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, FlowError> {
        let mut sessions = self.inner.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| FlowError::SessionNotFound(session_id.clone()))?;
        Ok(f(record))
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn load_flow_definition(&self, flow_id: &FlowId) -> Result<FlowDefinition, FlowError> {
        self.inner
            .flows
            .read()
            .await
            .get(flow_id)
            .cloned()
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.clone()))
    }

    async fn create_session(&self, record: SessionRecord) -> Result<(), FlowError> {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&record.session_id) {
            return Err(FlowError::Persistence(format!(
                "session '{}' already exists",
                record.session_id
            )));
        }
        sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, FlowError> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| FlowError::SessionNotFound(session_id.clone()))
    }

    async fn update_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), FlowError> {
        self.with_session(session_id, |record| record.status = status)
            .await
    }

    async fn update_current_step(
        &self,
        session_id: &SessionId,
        step_id: &StepId,
    ) -> Result<(), FlowError> {
        self.with_session(session_id, |record| {
            record.current_step_id = Some(step_id.clone())
        })
        .await
    }

    async fn record_failure(
        &self,
        session_id: &SessionId,
        failure: SessionFailure,
    ) -> Result<(), FlowError> {
        self.with_session(session_id, |record| record.last_error = Some(failure))
            .await
    }

    async fn append_execution_log(&self, entry: &StepExecution) -> Result<(), FlowError> {
        self.inner
            .journals
            .write()
            .await
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn load_execution_log(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StepExecution>, FlowError> {
        Ok(self
            .inner
            .journals
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{LogId, Step};

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = InMemoryStore::new();
        let id = SessionId::new("s1");
        store
            .create_session(SessionRecord::new(id.clone(), FlowId::new("f")))
            .await
            .unwrap();
        assert!(store
            .create_session(SessionRecord::new(id.clone(), FlowId::new("f")))
            .await
            .is_err());

        store
            .update_session_status(&id, SessionStatus::Running)
            .await
            .unwrap();
        store.update_current_step(&id, &StepId::new("talk")).await.unwrap();
        let record = store.load_session(&id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Running);
        assert_eq!(record.current_step_id, Some(StepId::new("talk")));

        let missing = store.load_session(&SessionId::new("nope")).await;
        assert!(matches!(missing, Err(FlowError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_journal_keeps_every_version() {
        let store = InMemoryStore::new();
        let id = SessionId::new("s1");
        let mut entry = StepExecution::pending(LogId::new(1), id.clone(), "start".into(), None, 0);
        entry.start().unwrap();
        store.append_execution_log(&entry).await.unwrap();
        entry.complete(parley_core::ResultType::Success).unwrap();
        store.append_execution_log(&entry).await.unwrap();

        assert_eq!(store.journal_len(&id).await, 2);
        assert_eq!(store.load_execution_log(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_flows() {
        let store = InMemoryStore::new();
        let other = store.clone();
        store
            .insert_flow(FlowDefinition {
                id: FlowId::new("f"),
                name: None,
                steps: vec![Step::start("start"), Step::end("end").at(1)],
                termination: Default::default(),
            })
            .await;
        assert!(other.load_flow_definition(&FlowId::new("f")).await.is_ok());
        assert!(matches!(
            other.load_flow_definition(&FlowId::new("g")).await,
            Err(FlowError::FlowNotFound(_))
        ));
    }
}
