//! An engine for multi-role, multi-step dialogue flows.
//!
//! A flow is a tree of typed steps. The engine walks it for one session at
//! a time: dialogue steps ask a [`GenerationClient`] for the next turn,
//! condition steps pick a branch, loop steps repeat their body, parallel
//! steps fan out. Every attempt is journaled, so a session that crashed or
//! was paused resumes where it stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::prelude::*;
//! use std::sync::Arc;
//!
//! let flow = FlowBuilder::new("debate")
//!     .then(Step::start("start"))
//!     .then(Step::repeat("rounds", 3))
//!     .child("rounds", Step::dialogue("argue", DialogueConfig::new(
//!         RoleAssignment::RoundRobin(vec!["pro".into(), "con".into()]),
//!     )))
//!     .then(Step::end("end"))
//!     .terminate_when(TerminationRules::default().keyword("I concede"))
//!     .build();
//!
//! let store = InMemoryStore::new();
//! store.insert_flow(flow).await;
//!
//! let engine = FlowEngine::builder()
//!     .roles(Arc::new(roles))
//!     .generator(Arc::new(client))
//!     .store(Arc::new(store))
//!     .build()?;
//!
//! let session = engine
//!     .create_session(NewSession::new("s-1", "debate").topic("Four-day work week"))
//!     .await?;
//! let report = engine.run_session(&session, CancellationToken::new()).await?;
//! println!("{} rounds, status {}", report.rounds, report.status);
//! ```

mod advancer;
mod config;
mod engine;
mod executor;
mod generation;
mod roles;
mod store;

// Re-export core types
pub use parley_core::*;

pub use config::EngineConfig;
pub use engine::{FlowEngine, FlowEngineBuilder, SessionReport};
pub use generation::{GenerationOutcome, RetryingGenerator};
pub use roles::RoleDirectory;
pub use store::InMemoryStore;
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        CancellationToken, ContextPolicy, DialogueConfig, EngineConfig, Expression, FlowBuilder,
        FlowEngine, FlowError, GenerationClient, GenerationRequest, InMemoryStore, JoinPolicy,
        NewSession, Persistence, Role, RoleAssignment, RoleDirectory, RoleProvider,
        SessionReport, SessionStatus, Step, TerminationRules,
    };
}
