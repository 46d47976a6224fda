//! Per-type step handlers.
//!
//! Every handler receives the step's log entry. A terminal entry means the
//! step already ran: the handler re-applies what was recorded and walks the
//! subtree for its replayed effects, without recording anything new.

use crate::advancer::{Advancer, Halt, Progress, Scope};
use crate::generation::GenerationOutcome;
use futures::stream::{FuturesUnordered, StreamExt};
use parley_core::{
    ConditionConfig, DialogueConfig, DialoguePayload, ExecutionStatus, FlowError,
    GenerationRequest, JoinPolicy, LoopConfig, Message, ParallelConfig, ResultType,
    RoleAssignment, SessionFailure, SessionStatus, Step, StepExecution, TerminationReason,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl Advancer {
    pub(crate) async fn run_start(&self, mut entry: StepExecution) -> Result<Progress, FlowError> {
        if !entry.is_terminal() {
            self.state.lock().await.ctx.set_status(SessionStatus::Running);
            entry.complete(ResultType::Success)?;
            self.record(&entry).await?;
        }
        Ok(Progress::Continue)
    }

    pub(crate) async fn run_end(&self, mut entry: StepExecution) -> Result<Progress, FlowError> {
        if !entry.is_terminal() {
            entry.complete(ResultType::Success)?;
            self.record(&entry).await?;
        }
        self.state.lock().await.ctx.set_status(SessionStatus::Completed);
        Ok(Progress::Halt(Halt::Ended))
    }

    pub(crate) async fn run_wait(&self, mut entry: StepExecution) -> Result<Progress, FlowError> {
        if !entry.is_terminal() {
            entry.complete(ResultType::Success)?;
            self.record(&entry).await?;
        }
        Ok(Progress::Continue)
    }

    pub(crate) async fn run_dialogue(
        &self,
        step: &Step,
        config: &DialogueConfig,
        mut entry: StepExecution,
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<Progress, FlowError> {
        match entry.status {
            ExecutionStatus::Completed => return self.replay_dialogue(step, &entry).await,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                return self.fail(entry, String::new()).await
            }
            _ => {}
        }

        let reference = match self.speaker(config, scope).await {
            Ok(reference) => reference,
            Err(message) => return self.fail(entry, message).await,
        };
        let role_id = self.record.bound_role(&reference);
        let role = match self.env.roles.get_role(&role_id).await {
            Ok(role) => role,
            Err(e) => return self.fail(entry, e.to_string()).await,
        };
        let target = match &config.target {
            Some(target) => {
                let target_id = self.record.bound_role(target);
                let name = match self.env.roles.get_role(&target_id).await {
                    Ok(role) => role.name,
                    Err(_) => target_id.to_string(),
                };
                Some(name)
            }
            None => None,
        };

        let generator = self.generator(config.timeout_ms, config.max_retries);
        let request = {
            let state = self.state.lock().await;
            GenerationRequest {
                role_prompt: self.compose_prompt(&role.prompt, config, target.as_deref()),
                messages: state
                    .ctx
                    .window(config.context, self.env.config.context_window),
                timeout: generator.timeout(),
                max_retries: generator.policy().max_retries(),
            }
        };

        match generator.generate(&request, cancel).await {
            GenerationOutcome::Completed { text, attempts } => {
                entry.attempt_count = attempts;
                let payload = DialoguePayload {
                    role_id: role.id.clone(),
                    role_name: role.name.clone(),
                    content: text.clone(),
                    output_variable: config.output_variable.clone(),
                };
                let verdict = {
                    let mut state = self.state.lock().await;
                    let round = state.ctx.complete_round(Message::new(
                        step.id.clone(),
                        role.id.clone(),
                        role.name.clone(),
                        text.clone(),
                    ));
                    if let Some(var) = &config.output_variable {
                        state.ctx.set_variable(var.clone(), text.into());
                    }
                    entry.round_index = round;
                    self.graph.termination().evaluate(&state.ctx)
                };
                entry.result_payload = Some(payload.to_value());
                entry.complete(ResultType::Success)?;
                self.record(&entry).await?;
                info!(
                    session_id = %self.record.session_id,
                    step_id = %step.id,
                    log_id = %entry.log_id,
                    role_id = %role.id,
                    round = entry.round_index,
                    attempt = attempts,
                    "Dialogue round completed"
                );
                Ok(self.after_round(step, verdict))
            }
            GenerationOutcome::Failed { error, attempts } => {
                entry.attempt_count = attempts;
                self.fail(entry, error.to_string()).await
            }
            GenerationOutcome::TimedOut { error, attempts } => {
                entry.attempt_count = attempts;
                let message = error.to_string();
                entry.time_out(message.clone())?;
                self.record(&entry).await?;
                Ok(Progress::Halt(Halt::Failed(SessionFailure {
                    step_id: step.id.clone(),
                    error_message: message,
                })))
            }
            GenerationOutcome::Cancelled { attempts } => {
                entry.attempt_count = attempts;
                let halt = self.cancel_halt();
                let result_type = if halt == Halt::Paused {
                    ResultType::Interrupted
                } else {
                    ResultType::Superseded
                };
                entry.skip(result_type, Some("generation cancelled".to_string()))?;
                self.record(&entry).await?;
                debug!(
                    session_id = %self.record.session_id,
                    step_id = %step.id,
                    log_id = %entry.log_id,
                    "Generation cancelled"
                );
                Ok(Progress::Halt(halt))
            }
        }
    }

    async fn replay_dialogue(
        &self,
        step: &Step,
        entry: &StepExecution,
    ) -> Result<Progress, FlowError> {
        let Some(payload) = entry.result_payload.as_ref().and_then(DialoguePayload::from_value)
        else {
            return Err(FlowError::Persistence(format!(
                "completed dialogue entry {} has no readable payload",
                entry.log_id
            )));
        };
        let verdict = {
            let mut state = self.state.lock().await;
            state
                .ctx
                .replay_dialogue(step.id.clone(), entry.round_index, payload);
            self.graph.termination().evaluate(&state.ctx)
        };
        Ok(self.after_round(step, verdict))
    }

    fn after_round(
        &self,
        step: &Step,
        verdict: Result<Option<TerminationReason>, FlowError>,
    ) -> Progress {
        match verdict {
            Ok(Some(reason)) => Progress::Halt(Halt::Terminated(reason)),
            Ok(None) => Progress::Continue,
            Err(e) => Progress::Halt(Halt::Failed(SessionFailure {
                step_id: step.id.clone(),
                error_message: e.to_string(),
            })),
        }
    }

    /// Role reference of the speaker for this pass.
    async fn speaker(&self, config: &DialogueConfig, scope: Scope) -> Result<String, String> {
        match &config.speaker {
            RoleAssignment::Fixed(reference) => Ok(reference.clone()),
            RoleAssignment::RoundRobin(references) => {
                if references.is_empty() {
                    return Err("round-robin speaker list is empty".to_string());
                }
                let at = scope.iteration as usize % references.len();
                Ok(references[at].clone())
            }
            RoleAssignment::FromVariable(name) => {
                let state = self.state.lock().await;
                match state.ctx.variable(name) {
                    Some(serde_json::Value::String(reference)) => Ok(reference.clone()),
                    Some(_) => Err(format!("variable '{name}' does not hold a role reference")),
                    None => Err(format!("variable '{name}' is not defined")),
                }
            }
        }
    }

    fn compose_prompt(&self, base: &str, config: &DialogueConfig, target: Option<&str>) -> String {
        let mut prompt = base.to_string();
        if let Some(topic) = &self.record.topic {
            prompt.push_str(&format!("\n\nTopic: {topic}"));
        }
        if let Some(task) = &config.task {
            prompt.push_str(&format!("\n\nTask: {task}"));
        }
        if let Some(target) = target {
            prompt.push_str(&format!("\n\nAddress your reply to {target}."));
        }
        prompt
    }

    pub(crate) async fn run_condition(
        &self,
        step: &Step,
        config: &ConditionConfig,
        mut entry: StepExecution,
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<Progress, FlowError> {
        let children = self.graph.children_of(&step.id)?;
        let inner = scope.within(entry.log_id);

        let chosen = match entry.status {
            ExecutionStatus::Completed => entry.condition_result.ok_or_else(|| {
                FlowError::Persistence(format!(
                    "completed condition entry {} has no result",
                    entry.log_id
                ))
            })?,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                return self.fail(entry, String::new()).await;
            }
            _ => {
                let verdict = {
                    let state = self.state.lock().await;
                    config.expression.evaluate(&state.ctx)
                };
                match verdict {
                    Ok(result) => {
                        entry.condition_result = Some(result);
                        entry.complete(if result {
                            ResultType::ConditionTrue
                        } else {
                            ResultType::ConditionFalse
                        })?;
                        self.record(&entry).await?;
                        debug!(
                            session_id = %self.record.session_id,
                            step_id = %step.id,
                            result,
                            "Condition evaluated"
                        );
                        result
                    }
                    Err(e) => {
                        let progress = self.fail(entry, e.to_string()).await?;
                        self.skip_steps(&children, inner, "condition could not be evaluated")
                            .await?;
                        return Ok(progress);
                    }
                }
            }
        };

        let branch = if chosen {
            &config.when_true
        } else {
            &config.when_false
        };
        let (taken, other): (Vec<&Step>, Vec<&Step>) =
            children.into_iter().partition(|c| branch.contains(&c.id));
        self.skip_steps(&other, inner, "condition chose the other branch")
            .await?;
        self.run_sequence(&taken, inner, cancel).await
    }

    pub(crate) async fn run_loop(
        &self,
        step: &Step,
        config: &LoopConfig,
        mut entry: StepExecution,
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<Progress, FlowError> {
        let children = self.graph.children_of(&step.id)?;
        let live = !entry.is_terminal();

        let entered = self
            .state
            .lock()
            .await
            .ctx
            .loops_mut()
            .enter(&step.id, config.max_iterations);
        if let Err(e) = entered {
            return self.fail(entry, e.to_string()).await;
        }

        loop {
            let (go, pass) = {
                let state = self.state.lock().await;
                let loops = state.ctx.loops();
                (loops.should_continue(&step.id), loops.iteration(&step.id).unwrap_or(0))
            };
            if !go {
                break;
            }

            let inner = Scope {
                parent: Some(entry.log_id),
                iteration: pass,
                ..scope
            };
            if let Progress::Halt(halt) = self.run_sequence(&children, inner, cancel).await? {
                self.state.lock().await.ctx.loops_mut().exit(&step.id);
                return self.close_loop(entry, halt, pass).await;
            }

            if let Some(exit_when) = &config.exit_when {
                let verdict = {
                    let state = self.state.lock().await;
                    exit_when.evaluate(&state.ctx)
                };
                match verdict {
                    Ok(true) => {
                        self.state.lock().await.ctx.loops_mut().request_exit(&step.id);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.state.lock().await.ctx.loops_mut().exit(&step.id);
                        entry.loop_count = Some(pass);
                        return self.fail(entry, e.to_string()).await;
                    }
                }
            }

            let done = self
                .state
                .lock()
                .await
                .ctx
                .loops_mut()
                .advance(&step.id)
                .unwrap_or(pass + 1);
            if live {
                entry.loop_count = Some(done);
                self.record(&entry).await?;
            }
        }

        let (passes, broke, bounded) = {
            let mut state = self.state.lock().await;
            let loops = state.ctx.loops_mut();
            let broke = loops.exit_requested(&step.id);
            let bounded = loops.bound_reached(&step.id);
            (loops.exit(&step.id).unwrap_or(0), broke, bounded)
        };
        if bounded && !broke {
            let reason = FlowError::LoopBoundExceeded {
                step_id: step.id.clone(),
                max_iterations: config.max_iterations,
            };
            debug!(
                session_id = %self.record.session_id,
                step_id = %step.id,
                %reason,
                "Loop finished"
            );
        }
        if live {
            entry.loop_count = Some(passes);
            entry.complete(if broke {
                ResultType::LoopBreak
            } else {
                ResultType::LoopCompleted
            })?;
            self.record(&entry).await?;
        }
        Ok(Progress::Continue)
    }

    /// Settles a loop entry whose body halted during `pass`.
    async fn close_loop(
        &self,
        mut entry: StepExecution,
        halt: Halt,
        pass: u32,
    ) -> Result<Progress, FlowError> {
        if entry.is_terminal() {
            return Ok(Progress::Halt(halt));
        }
        entry.loop_count = Some(pass);
        match &halt {
            Halt::Failed(failure) => {
                entry.fail(format!(
                    "pass {pass} failed at step '{}': {}",
                    failure.step_id, failure.error_message
                ))?;
            }
            Halt::Ended | Halt::Terminated(_) => entry.complete(ResultType::LoopBreak)?,
            Halt::Superseded => {
                entry.skip(ResultType::Superseded, Some("branch superseded".to_string()))?
            }
            Halt::Paused => {
                entry.skip(ResultType::Interrupted, Some("session paused".to_string()))?
            }
        }
        self.record(&entry).await?;
        Ok(Progress::Halt(halt))
    }

    pub(crate) async fn run_parallel(
        &self,
        step: &Step,
        config: &ParallelConfig,
        mut entry: StepExecution,
        scope: Scope,
        cancel: &CancellationToken,
    ) -> Result<Progress, FlowError> {
        let children = self.graph.children_of(&step.id)?;
        let inner = Scope {
            parent: Some(entry.log_id),
            in_parallel: true,
            ..scope
        };
        let tokens: Vec<CancellationToken> = children.iter().map(|_| cancel.child_token()).collect();
        let mut branches: FuturesUnordered<_> = children
            .iter()
            .zip(&tokens)
            .enumerate()
            .map(|(i, (child, token))| async move {
                (i, self.run_sequence(&[*child], inner, token).await)
            })
            .collect();

        if entry.is_terminal() {
            let mut terminated = None;
            while let Some((_, result)) = branches.next().await {
                if let Progress::Halt(Halt::Terminated(reason)) = result? {
                    terminated.get_or_insert(reason);
                }
            }
            return match (terminated, entry.status) {
                (Some(reason), _) => Ok(Progress::Halt(Halt::Terminated(reason))),
                (None, ExecutionStatus::Failed) => self.fail(entry, String::new()).await,
                _ => Ok(Progress::Continue),
            };
        }

        let mut winner: Option<usize> = None;
        let mut failure: Option<SessionFailure> = None;
        let mut stop: Option<Halt> = None;
        while let Some((i, result)) = branches.next().await {
            match result? {
                Progress::Continue => {
                    if config.join == JoinPolicy::Any && winner.is_none() {
                        winner = Some(i);
                        for (j, token) in tokens.iter().enumerate() {
                            if j != i {
                                token.cancel();
                            }
                        }
                    }
                }
                Progress::Halt(Halt::Failed(f)) => {
                    failure.get_or_insert(f);
                }
                Progress::Halt(halt @ (Halt::Terminated(_) | Halt::Ended)) => {
                    tokens.iter().for_each(CancellationToken::cancel);
                    stop.get_or_insert(halt);
                }
                Progress::Halt(Halt::Paused) => {
                    stop.get_or_insert(Halt::Paused);
                }
                Progress::Halt(Halt::Superseded) => {
                    if cancel.is_cancelled() {
                        stop.get_or_insert(self.cancel_halt());
                    }
                }
            }
        }
        drop(branches);

        if cancel.is_cancelled() && !matches!(stop, Some(Halt::Terminated(_) | Halt::Ended)) {
            let halt = self.cancel_halt();
            return self.interrupt(entry, halt).await;
        }

        match stop {
            Some(Halt::Paused) => return self.interrupt(entry, Halt::Paused).await,
            Some(halt) => {
                entry.complete(ResultType::Success)?;
                self.record(&entry).await?;
                return Ok(Progress::Halt(halt));
            }
            None => {}
        }

        let failed = match config.join {
            JoinPolicy::All => failure,
            JoinPolicy::Any if winner.is_none() => failure,
            JoinPolicy::Any => None,
        };
        match failed {
            Some(f) => {
                let message = format!(
                    "branch step '{}' failed: {}",
                    f.step_id, f.error_message
                );
                self.fail(entry, message).await?;
                Ok(Progress::Halt(Halt::Failed(f)))
            }
            None => {
                entry.complete(ResultType::Success)?;
                self.record(&entry).await?;
                Ok(Progress::Continue)
            }
        }
    }

    /// Closes a parallel entry whose branches were cancelled.
    async fn interrupt(&self, mut entry: StepExecution, halt: Halt) -> Result<Progress, FlowError> {
        let (result_type, reason) = match halt {
            Halt::Paused => (ResultType::Interrupted, "session paused"),
            _ => (ResultType::Superseded, "branch superseded"),
        };
        entry.skip(result_type, Some(reason.to_string()))?;
        self.record(&entry).await?;
        Ok(Progress::Halt(halt))
    }
}
