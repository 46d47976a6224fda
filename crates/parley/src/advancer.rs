//! Drives one session through its step graph.
//!
//! The walk is journal-driven. Every dispatch first looks the step up in the
//! execution log under `(step_id, parent_log_id, loop_iteration)`:
//!
//! - a terminal entry is replayed: its recorded effects are applied to the
//!   context and nothing external is called,
//! - a non-terminal entry is resumed under the same log id,
//! - no entry, or one interrupted by a pause, starts a fresh attempt.
//!
//! A pause closes every open entry as interrupted, containers included. The
//! fresh attempt of a container points back at the interrupted one, so the
//! children it already finished are found and replayed.
//!
//! Replaying a complete log therefore rebuilds the context without adding a
//! single entry, and a crashed or paused session continues exactly at the
//! first step without a terminal entry.

use crate::config::EngineConfig;
use crate::generation::RetryingGenerator;
use futures::future::BoxFuture;
use parley_core::{
    ExecutionContext, ExecutionLog, ExecutionStatus, FlowError, GenerationClient, LogId,
    Persistence, ResultType, RetryPolicy, RoleProvider, SessionFailure, SessionRecord,
    SessionStatus, Step, StepExecution, StepGraph, StepKind, TerminationReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a step sits in the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Scope {
    /// Log entry of the enclosing container.
    pub parent: Option<LogId>,
    /// Pass of the innermost enclosing loop.
    pub iteration: u32,
    /// Inside a parallel branch; such steps do not move `current_step_id`.
    pub in_parallel: bool,
}

impl Scope {
    pub fn root() -> Self {
        Self {
            parent: None,
            iteration: 0,
            in_parallel: false,
        }
    }

    pub fn within(self, container: LogId) -> Self {
        Self {
            parent: Some(container),
            ..self
        }
    }
}

/// Why a walk stopped before running out of steps.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    Ended,
    Terminated(TerminationReason),
    Failed(SessionFailure),
    /// The session token was cancelled.
    Paused,
    /// Only this branch's token was cancelled.
    Superseded,
}

impl Halt {
    /// Reason logged on the steps a halt cuts off. Paused walks leave them
    /// unlogged so they run on resume.
    fn skip_reason(&self) -> Option<String> {
        match self {
            Halt::Ended => Some("session ended at an end step".to_string()),
            Halt::Terminated(reason) => Some(format!("session terminated: {reason}")),
            Halt::Failed(failure) => Some(format!("aborted after step '{}' failed", failure.step_id)),
            Halt::Superseded => Some("branch superseded".to_string()),
            Halt::Paused => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Progress {
    Continue,
    Halt(Halt),
}

/// Final state of one `run`.
#[derive(Debug, Clone)]
pub(crate) struct RunOutcome {
    pub context: ExecutionContext,
    pub status: SessionStatus,
    pub failure: Option<SessionFailure>,
    pub termination: Option<TerminationReason>,
}

pub(crate) struct SessionState {
    pub ctx: ExecutionContext,
    pub log: ExecutionLog,
}

/// Collaborators shared by every session of an engine.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub roles: Arc<dyn RoleProvider>,
    pub generator: Arc<dyn GenerationClient>,
    pub store: Arc<dyn Persistence>,
    pub config: EngineConfig,
    pub retry: RetryPolicy,
}

pub(crate) struct Advancer {
    pub(crate) graph: Arc<StepGraph>,
    pub(crate) record: SessionRecord,
    pub(crate) env: Collaborators,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) cancel: CancellationToken,
}

impl Advancer {
    pub fn new(
        graph: Arc<StepGraph>,
        record: SessionRecord,
        log: ExecutionLog,
        env: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = ExecutionContext::for_session(&record);
        Self {
            graph,
            record,
            env,
            state: Mutex::new(SessionState { ctx, log }),
            cancel,
        }
    }

    pub async fn run(self) -> Result<RunOutcome, FlowError> {
        let session_id = self.record.session_id.clone();
        self.set_status(SessionStatus::Running).await?;

        let graph = Arc::clone(&self.graph);
        let roots = graph.roots();
        let progress = self.run_sequence(&roots, Scope::root(), &self.cancel).await?;
        let outcome = self.finalize(progress).await?;

        info!(
            session_id = %session_id,
            status = %outcome.status,
            rounds = outcome.context.rounds(),
            "Session run finished"
        );
        Ok(outcome)
    }

    /// Dispatches steps in order until one halts. Steps after a halt are
    /// logged as skipped, except after a pause.
    pub(crate) async fn run_sequence(
        &self,
        steps: &[&Step],
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<Progress, FlowError> {
        for (i, step) in steps.iter().enumerate() {
            if let Progress::Halt(halt) = self.dispatch(step, scope, cancel).await? {
                if let Some(reason) = halt.skip_reason() {
                    self.skip_steps(&steps[i + 1..], scope, &reason).await?;
                }
                return Ok(Progress::Halt(halt));
            }
        }
        Ok(Progress::Continue)
    }

    pub(crate) fn dispatch<'a>(
        &'a self,
        step: &'a Step,
        scope: Scope,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Progress, FlowError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                let halt = self.cancel_halt();
                if halt == Halt::Superseded {
                    self.skip_subtree(step, scope, "branch superseded").await?;
                }
                return Ok(Progress::Halt(halt));
            }

            let entry = self.open_entry(step, scope).await?;
            if entry.status == ExecutionStatus::Skipped {
                return Ok(Progress::Continue);
            }
            if entry.is_terminal() {
                debug!(
                    session_id = %self.record.session_id,
                    step_id = %step.id,
                    log_id = %entry.log_id,
                    status = %entry.status,
                    "Replaying step"
                );
            } else {
                debug!(
                    session_id = %self.record.session_id,
                    step_id = %step.id,
                    log_id = %entry.log_id,
                    step_type = %step.step_type(),
                    "Dispatching step"
                );
                if !scope.in_parallel {
                    self.move_to(step).await?;
                }
            }

            let progress = match &step.kind {
                StepKind::Start => self.run_start(entry).await?,
                StepKind::End => self.run_end(entry).await?,
                StepKind::Wait => self.run_wait(entry).await?,
                StepKind::Dialogue(config) => {
                    self.run_dialogue(step, config, entry, scope, cancel).await?
                }
                StepKind::Condition(config) => {
                    self.run_condition(step, config, entry, scope, cancel).await?
                }
                StepKind::Loop(config) => self.run_loop(step, config, entry, scope, cancel).await?,
                StepKind::Parallel(config) => {
                    self.run_parallel(step, config, entry, scope, cancel).await?
                }
            };

            match progress {
                Progress::Halt(Halt::Failed(failure)) if step.optional => {
                    warn!(
                        session_id = %self.record.session_id,
                        step_id = %step.id,
                        failed_step = %failure.step_id,
                        error = %failure.error_message,
                        "Optional step failed, continuing"
                    );
                    Ok(Progress::Continue)
                }
                other => Ok(other),
            }
        })
    }

    /// Finds the entry for this step and scope, or starts a fresh one.
    ///
    /// Returned entries are either terminal (replay) or running.
    async fn open_entry(&self, step: &Step, scope: Scope) -> Result<StepExecution, FlowError> {
        let mut entry = {
            let mut state = self.state.lock().await;
            let existing = state
                .log
                .find(&step.id, scope.parent, scope.iteration)
                .cloned();
            match existing {
                Some(entry) if entry.status == ExecutionStatus::Pending => entry,
                Some(entry) if !entry.is_interrupted() => return Ok(entry),
                previous => {
                    let log_id = state.log.next_log_id();
                    let mut entry = StepExecution::pending(
                        log_id,
                        self.record.session_id.clone(),
                        step.id.clone(),
                        scope.parent,
                        scope.iteration,
                    );
                    entry.resumes = previous.map(|e| e.log_id);
                    entry.round_index = state.ctx.rounds();
                    // reserve the id before the lock is released
                    state.log.record(entry.clone())?;
                    entry
                }
            }
        };
        entry.start()?;
        self.record(&entry).await?;
        Ok(entry)
    }

    /// Journals a new version of an entry, in memory first.
    pub(crate) async fn record(&self, entry: &StepExecution) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock().await;
            state.log.record(entry.clone())?;
        }
        self.env.store.append_execution_log(entry).await
    }

    pub(crate) async fn skip_steps(
        &self,
        steps: &[&Step],
        scope: Scope,
        reason: &str,
    ) -> Result<(), FlowError> {
        for step in steps {
            self.skip_subtree(step, scope, reason).await?;
        }
        Ok(())
    }

    /// Logs a step and all of its descendants as skipped. A step that
    /// already has a terminal entry keeps it, along with its subtree.
    pub(crate) fn skip_subtree<'a>(
        &'a self,
        step: &'a Step,
        scope: Scope,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), FlowError>> {
        Box::pin(async move {
            let entry = {
                let mut state = self.state.lock().await;
                match state.log.find(&step.id, scope.parent, scope.iteration).cloned() {
                    Some(existing) if existing.is_terminal() && !existing.is_interrupted() => {
                        None
                    }
                    Some(existing) if !existing.is_terminal() => Some(existing),
                    _ => {
                        let log_id = state.log.next_log_id();
                        let mut entry = StepExecution::pending(
                            log_id,
                            self.record.session_id.clone(),
                            step.id.clone(),
                            scope.parent,
                            scope.iteration,
                        );
                        entry.round_index = state.ctx.rounds();
                        // reserve the id before the lock is released
                        state.log.record(entry.clone())?;
                        Some(entry)
                    }
                }
            };

            let Some(mut entry) = entry else {
                return Ok(());
            };
            entry.skip(ResultType::Superseded, Some(reason.to_string()))?;
            self.record(&entry).await?;
            debug!(
                session_id = %self.record.session_id,
                step_id = %step.id,
                log_id = %entry.log_id,
                reason,
                "Step skipped"
            );

            let children = self.graph.children_of(&step.id)?;
            let inner = Scope {
                parent: Some(entry.log_id),
                iteration: if matches!(step.kind, StepKind::Loop(_)) {
                    0
                } else {
                    scope.iteration
                },
                ..scope
            };
            for child in children {
                self.skip_subtree(child, inner, reason).await?;
            }
            Ok(())
        })
    }

    /// The halt a cancelled token means for the current walk.
    pub(crate) fn cancel_halt(&self) -> Halt {
        if self.cancel.is_cancelled() {
            Halt::Paused
        } else {
            Halt::Superseded
        }
    }

    /// Marks a running entry as failed and turns it into a session failure.
    /// A replayed failure is reported as recorded.
    pub(crate) async fn fail(
        &self,
        mut entry: StepExecution,
        message: String,
    ) -> Result<Progress, FlowError> {
        if entry.is_terminal() {
            let error_message = entry.error_message.unwrap_or(message);
            return Ok(Progress::Halt(Halt::Failed(SessionFailure {
                step_id: entry.step_id,
                error_message,
            })));
        }
        warn!(
            session_id = %self.record.session_id,
            step_id = %entry.step_id,
            log_id = %entry.log_id,
            error = %message,
            "Step failed"
        );
        entry.fail(message.clone())?;
        self.record(&entry).await?;
        Ok(Progress::Halt(Halt::Failed(SessionFailure {
            step_id: entry.step_id,
            error_message: message,
        })))
    }

    pub(crate) fn generator(&self, timeout_ms: Option<u64>, max_retries: Option<u32>) -> RetryingGenerator {
        let policy = match max_retries {
            Some(n) => self.env.retry.with_max_retries(n),
            None => self.env.retry.clone(),
        };
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.env.config.generation_timeout());
        RetryingGenerator::new(Arc::clone(&self.env.generator), policy, timeout)
    }

    async fn move_to(&self, step: &Step) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock().await;
            state.ctx.set_current_step(step.id.clone());
        }
        self.env
            .store
            .update_current_step(&self.record.session_id, &step.id)
            .await
    }

    pub(crate) async fn set_status(&self, status: SessionStatus) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock().await;
            state.ctx.set_status(status);
        }
        self.env
            .store
            .update_session_status(&self.record.session_id, status)
            .await
    }

    async fn finalize(self, progress: Progress) -> Result<RunOutcome, FlowError> {
        let (status, failure, termination) = match progress {
            Progress::Continue | Progress::Halt(Halt::Ended) => {
                (SessionStatus::Completed, None, None)
            }
            Progress::Halt(Halt::Terminated(reason)) => {
                info!(session_id = %self.record.session_id, %reason, "Session terminated early");
                (SessionStatus::Completed, None, Some(reason))
            }
            Progress::Halt(Halt::Failed(failure)) => (SessionStatus::Failed, Some(failure), None),
            Progress::Halt(Halt::Paused | Halt::Superseded) => (SessionStatus::Paused, None, None),
        };

        if let Some(failure) = &failure {
            warn!(
                session_id = %self.record.session_id,
                step_id = %failure.step_id,
                error = %failure.error_message,
                "Session failed"
            );
            self.env
                .store
                .record_failure(&self.record.session_id, failure.clone())
                .await?;
        }
        self.set_status(status).await?;

        let state = self.state.into_inner();
        Ok(RunOutcome {
            context: state.ctx,
            status,
            failure,
            termination,
        })
    }
}
