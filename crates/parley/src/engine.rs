//! The engine facade.

use crate::advancer::{Advancer, Collaborators};
use crate::config::EngineConfig;
use parley_core::{
    ExecutionContext, ExecutionLog, ExecutionSummary, FlowError, FlowId, FlowVisualizationData,
    GenerationClient, Message, NewSession, Persistence, RoleProvider, SessionFailure, SessionId,
    SessionRecord, SessionStatus, StepGraph, TerminationReason,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of [`FlowEngine::run_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub rounds: u32,
    pub messages: Vec<Message>,
    pub variables: HashMap<String, Value>,
    /// Last failing step and its error, for failed sessions.
    pub failure: Option<SessionFailure>,
    /// Set when a termination rule ended the session in this run.
    pub termination: Option<TerminationReason>,
}

impl SessionReport {
    fn from_context(
        ctx: ExecutionContext,
        status: SessionStatus,
        failure: Option<SessionFailure>,
        termination: Option<TerminationReason>,
    ) -> Self {
        Self {
            session_id: ctx.session_id().clone(),
            status,
            rounds: ctx.rounds(),
            messages: ctx.message_history().to_vec(),
            variables: ctx.variables().clone(),
            failure,
            termination,
        }
    }
}

/// Runs dialogue flow sessions.
///
/// Sessions are independent: each run owns its own context and log, and
/// the engine only prevents the same session from running twice at once.
///
/// # Examples
///
/// ```rust,ignore
/// let engine = FlowEngine::builder()
///     .roles(Arc::new(roles))
///     .generator(Arc::new(client))
///     .store(Arc::new(store))
///     .build()?;
///
/// let session = engine.create_session(NewSession::new("s-1", "debate")).await?;
/// let report = engine.run_session(&session, CancellationToken::new()).await?;
/// ```
pub struct FlowEngine {
    env: Collaborators,
    graphs: RwLock<HashMap<FlowId, Arc<StepGraph>>>,
    active: Arc<Mutex<HashSet<SessionId>>>,
}

impl fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEngine")
            .field("config", &self.env.config)
            .finish()
    }
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    /// Stores a new session after checking that its flow is valid.
    pub async fn create_session(&self, session: NewSession) -> Result<SessionId, FlowError> {
        self.graph(session.flow_id()).await?;
        let record = session.into_record();
        let session_id = record.session_id.clone();
        self.env.store.create_session(record).await?;
        info!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Runs a session until it completes, fails or is paused.
    ///
    /// A session with log entries is resumed: finished steps are replayed
    /// from the log and execution continues at the first unfinished step.
    /// Cancelling `cancel` pauses the session; a later call resumes it.
    ///
    /// # Errors
    ///
    /// - [`FlowError::ConcurrentExecution`] if the session is already running
    /// - [`FlowError::SessionNotFound`] / [`FlowError::FlowNotFound`]
    /// - any error raised by the persistence collaborator
    pub async fn run_session(
        &self,
        session_id: &SessionId,
        cancel: CancellationToken,
    ) -> Result<SessionReport, FlowError> {
        let _guard = ActiveSession::acquire(&self.active, session_id)?;

        let record = self.env.store.load_session(session_id).await?;
        let journal = self.env.store.load_execution_log(session_id).await?;
        let log = ExecutionLog::from_entries(session_id.clone(), journal);

        if record.status.is_finished() {
            info!(session_id = %session_id, status = %record.status, "Session already finished");
            let ctx = ExecutionContext::from_log(&record, &log);
            return Ok(SessionReport::from_context(
                ctx,
                record.status,
                record.last_error.clone(),
                None,
            ));
        }

        let graph = self.graph(&record.flow_id).await?;
        info!(
            session_id = %session_id,
            flow_id = %record.flow_id,
            resumed = !log.is_empty(),
            "Session run starting"
        );

        let advancer = Advancer::new(graph, record, log, self.env.clone(), cancel);
        let outcome = advancer.run().await?;
        Ok(SessionReport::from_context(
            outcome.context,
            outcome.status,
            outcome.failure,
            outcome.termination,
        ))
    }

    /// Builds the visualization read-model from stored state only.
    pub async fn visualize(&self, session_id: &SessionId) -> Result<FlowVisualizationData, FlowError> {
        let (record, log) = self.snapshot(session_id).await?;
        let graph = self.graph(&record.flow_id).await?;
        Ok(FlowVisualizationData::build(&graph, &log, &record))
    }

    pub async fn statistics(&self, session_id: &SessionId) -> Result<ExecutionSummary, FlowError> {
        let (_, log) = self.snapshot(session_id).await?;
        Ok(ExecutionSummary::from_log(&log))
    }

    async fn snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<(SessionRecord, ExecutionLog), FlowError> {
        let record = self.env.store.load_session(session_id).await?;
        let journal = self.env.store.load_execution_log(session_id).await?;
        Ok((record, ExecutionLog::from_entries(session_id.clone(), journal)))
    }

    /// Loads and validates a flow once; later calls share the cached graph.
    async fn graph(&self, flow_id: &FlowId) -> Result<Arc<StepGraph>, FlowError> {
        if let Some(graph) = self.graphs.read().await.get(flow_id) {
            return Ok(Arc::clone(graph));
        }
        let definition = self.env.store.load_flow_definition(flow_id).await?;
        let graph = Arc::new(StepGraph::new(definition)?);
        self.graphs
            .write()
            .await
            .insert(flow_id.clone(), Arc::clone(&graph));
        Ok(graph)
    }
}

/// Marks a session as running for as long as it lives.
struct ActiveSession {
    registry: Arc<Mutex<HashSet<SessionId>>>,
    session_id: SessionId,
}

impl ActiveSession {
    fn acquire(
        registry: &Arc<Mutex<HashSet<SessionId>>>,
        session_id: &SessionId,
    ) -> Result<Self, FlowError> {
        let mut active = registry
            .lock()
            .map_err(|_| FlowError::ConcurrentExecution("session registry poisoned".into()))?;
        if !active.insert(session_id.clone()) {
            return Err(FlowError::ConcurrentExecution(format!(
                "session '{session_id}' is already running"
            )));
        }
        Ok(Self {
            registry: Arc::clone(registry),
            session_id: session_id.clone(),
        })
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if let Ok(mut active) = self.registry.lock() {
            active.remove(&self.session_id);
        }
    }
}

/// Builder for [`FlowEngine`].
#[derive(Default)]
pub struct FlowEngineBuilder {
    roles: Option<Arc<dyn RoleProvider>>,
    generator: Option<Arc<dyn GenerationClient>>,
    store: Option<Arc<dyn Persistence>>,
    config: EngineConfig,
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles(mut self, roles: Arc<dyn RoleProvider>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn GenerationClient>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// - [`FlowError::Definition`] if a collaborator is missing
    /// - [`FlowError::Configuration`] if the configuration is invalid
    pub fn build(self) -> Result<FlowEngine, FlowError> {
        let missing = |what: &str| FlowError::Definition(format!("engine needs a {what}"));
        let roles = self.roles.ok_or_else(|| missing("role provider"))?;
        let generator = self.generator.ok_or_else(|| missing("generation client"))?;
        let store = self.store.ok_or_else(|| missing("store"))?;
        self.config.validate()?;
        let retry = self.config.retry_policy()?;

        Ok(FlowEngine {
            env: Collaborators {
                roles,
                generator,
                store,
                config: self.config,
                retry,
            },
            graphs: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStore, RoleDirectory};
    use async_trait::async_trait;
    use parley_core::GenerationRequest;

    struct Echo;

    #[async_trait]
    impl GenerationClient for Echo {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, FlowError> {
            Ok(request.role_prompt.clone())
        }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = FlowEngine::builder()
            .roles(Arc::new(RoleDirectory::new()))
            .generator(Arc::new(Echo))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid flow definition: engine needs a store");

        let bad_config = FlowEngine::builder()
            .roles(Arc::new(RoleDirectory::new()))
            .generator(Arc::new(Echo))
            .store(Arc::new(InMemoryStore::new()))
            .config(EngineConfig {
                context_window: 0,
                ..EngineConfig::default()
            })
            .build();
        assert!(matches!(bad_config, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_active_session_guard() {
        let registry = Arc::new(Mutex::new(HashSet::new()));
        let id = SessionId::new("s1");
        let guard = ActiveSession::acquire(&registry, &id).unwrap();
        assert!(matches!(
            ActiveSession::acquire(&registry, &id),
            Err(FlowError::ConcurrentExecution(_))
        ));
        drop(guard);
        assert!(ActiveSession::acquire(&registry, &id).is_ok());
    }

    #[tokio::test]
    async fn test_create_session_rejects_unknown_flow() {
        let engine = FlowEngine::builder()
            .roles(Arc::new(RoleDirectory::new()))
            .generator(Arc::new(Echo))
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        let err = engine
            .create_session(NewSession::new("s1", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(_)));
    }
}
