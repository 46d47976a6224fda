//! The execution log: one record per step-execution attempt.
//!
//! Entries are journaled. Every status change of an attempt is appended as a
//! new version of the same [`LogId`]; the latest version wins when the log is
//! read back.

use crate::context::SessionId;
use crate::error::FlowError;
use crate::step::StepId;
use crate::traits::RoleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Session-wide sequence number of a log entry. Doubles as execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(u64);

impl LogId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of one step-execution attempt.
///
/// ```text
/// pending -> running -> completed | failed | timeout
/// pending -> skipped
/// running -> skipped          (cancelled mid-flight)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Timeout
        )
    }

    /// Whether an attempt in this status may move to `next`.
    ///
    /// Re-recording a non-terminal status is allowed so that progress
    /// fields (loop counts, attempt counts) can be journaled.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, b) if a == b => !a.is_terminal(),
            (Pending, Running | Skipped) => true,
            (Running, Completed | Failed | Timeout | Skipped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Why an attempt ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Success,
    ConditionTrue,
    ConditionFalse,
    /// The loop ran until its iteration bound.
    LoopCompleted,
    /// The loop's exit expression fired before the bound.
    LoopBreak,
    Error,
    /// Not executed: an unchosen branch, a losing `any` branch, or a step
    /// cut off by an end step or a termination rule.
    Superseded,
    /// Cut off by a session pause. Such an entry is re-executed on resume.
    Interrupted,
}

/// One step-execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub log_id: LogId,
    pub step_id: StepId,
    pub session_id: SessionId,
    /// Log entry of the enclosing container step, if any.
    pub parent_log_id: Option<LogId>,
    /// Interrupted attempt this entry picks up after a pause. Children
    /// recorded under that attempt still count for this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumes: Option<LogId>,
    pub status: ExecutionStatus,
    pub result_type: Option<ResultType>,
    /// Session round count after this attempt; only dialogue steps advance it.
    pub round_index: u32,
    /// Pass of the innermost enclosing loop; 0 outside any loop.
    pub loop_iteration: u32,
    pub attempt_count: u32,
    pub result_payload: Option<Value>,
    pub error_message: Option<String>,
    pub condition_result: Option<bool>,
    pub loop_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StepExecution {
    pub fn pending(
        log_id: LogId,
        session_id: SessionId,
        step_id: StepId,
        parent_log_id: Option<LogId>,
        loop_iteration: u32,
    ) -> Self {
        Self {
            log_id,
            step_id,
            session_id,
            parent_log_id,
            resumes: None,
            status: ExecutionStatus::Pending,
            result_type: None,
            round_index: 0,
            loop_iteration,
            attempt_count: 0,
            result_payload: None,
            error_message: None,
            condition_result: None,
            loop_count: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    pub fn complete(&mut self, result_type: ResultType) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Completed)?;
        self.result_type = Some(result_type);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Failed)?;
        self.result_type = Some(ResultType::Error);
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn time_out(&mut self, message: impl Into<String>) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Timeout)?;
        self.result_type = Some(ResultType::Error);
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn skip(
        &mut self,
        result_type: ResultType,
        reason: Option<String>,
    ) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Skipped)?;
        self.result_type = Some(result_type);
        self.error_message = reason;
        Ok(())
    }

    /// Whether this entry was cut off by a pause and must run again.
    pub fn is_interrupted(&self) -> bool {
        self.status == ExecutionStatus::Skipped
            && self.result_type == Some(ResultType::Interrupted)
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(to) {
            return Err(FlowError::InvalidTransition {
                log_id: self.log_id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            let now = Utc::now();
            self.completed_at = Some(now);
            let start = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
        Ok(())
    }
}

/// Result payload of a completed dialogue step.
///
/// Carries everything needed to rebuild the message history on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialoguePayload {
    pub role_id: RoleId,
    pub role_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl DialoguePayload {
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::json!({
            "role_id": self.role_id,
            "role_name": self.role_name,
            "content": self.content,
        });
        if let (Some(var), Value::Object(map)) = (&self.output_variable, &mut value) {
            map.insert("output_variable".into(), Value::String(var.clone()));
        }
        value
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// The execution log of one session, keyed by [`LogId`].
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    session_id: SessionId,
    entries: BTreeMap<LogId, StepExecution>,
}

impl ExecutionLog {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            entries: BTreeMap::new(),
        }
    }

    /// Rebuilds a log from a persisted journal; later versions of an entry
    /// replace earlier ones.
    pub fn from_entries(
        session_id: SessionId,
        journal: impl IntoIterator<Item = StepExecution>,
    ) -> Self {
        let mut log = Self::new(session_id);
        for entry in journal {
            log.entries.insert(entry.log_id, entry);
        }
        log
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Records a new entry or a new version of an existing one.
    ///
    /// # Errors
    ///
    /// - [`FlowError::InvalidTransition`] if the status change is not allowed
    /// - [`FlowError::ConcurrentExecution`] if another attempt of the same
    ///   step is already running
    pub fn record(&mut self, entry: StepExecution) -> Result<(), FlowError> {
        match self.entries.get(&entry.log_id) {
            Some(previous) if !previous.status.can_transition_to(entry.status) => {
                return Err(FlowError::InvalidTransition {
                    log_id: entry.log_id,
                    from: previous.status,
                    to: entry.status,
                });
            }
            Some(_) => {}
            None => {}
        }
        if entry.status == ExecutionStatus::Running {
            let conflict = self.entries.values().find(|e| {
                e.log_id != entry.log_id
                    && e.step_id == entry.step_id
                    && e.status == ExecutionStatus::Running
            });
            if let Some(other) = conflict {
                return Err(FlowError::ConcurrentExecution(format!(
                    "step '{}' already has running attempt {}",
                    entry.step_id, other.log_id
                )));
            }
        }
        self.entries.insert(entry.log_id, entry);
        Ok(())
    }

    pub fn get(&self, log_id: LogId) -> Option<&StepExecution> {
        self.entries.get(&log_id)
    }

    /// Entries in execution order.
    pub fn entries(&self) -> impl Iterator<Item = &StepExecution> {
        self.entries.values()
    }

    pub fn for_step<'a>(
        &'a self,
        step_id: &StepId,
    ) -> impl Iterator<Item = &'a StepExecution> + 'a {
        let step_id = step_id.clone();
        self.entries.values().filter(move |e| e.step_id == step_id)
    }

    /// The latest attempt of `step_id` within the given container entry and
    /// loop pass. When the container resumes an interrupted attempt, the
    /// search falls back to that attempt's children.
    pub fn find(
        &self,
        step_id: &StepId,
        parent_log_id: Option<LogId>,
        loop_iteration: u32,
    ) -> Option<&StepExecution> {
        let mut parent = parent_log_id;
        loop {
            let hit = self.entries.values().rev().find(|e| {
                &e.step_id == step_id
                    && e.parent_log_id == parent
                    && e.loop_iteration == loop_iteration
            });
            if hit.is_some() {
                return hit;
            }
            let previous = self.entries.get(&parent?)?.resumes;
            parent = Some(previous?);
        }
    }

    pub fn next_log_id(&self) -> LogId {
        self.entries
            .keys()
            .next_back()
            .map(|id| id.next())
            .unwrap_or(LogId::new(1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(log_id: u64, step: &str) -> StepExecution {
        StepExecution::pending(
            LogId::new(log_id),
            SessionId::new("s1"),
            StepId::new(step),
            None,
            0,
        )
    }

    #[test]
    fn test_state_machine() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Timeout));
        assert!(Running.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Skipped));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut e = entry(1, "ask");
        e.start().unwrap();
        assert!(e.started_at.is_some());
        e.complete(ResultType::Success).unwrap();
        assert_eq!(e.status, ExecutionStatus::Completed);
        assert!(e.duration_ms.is_some());

        let err = e.fail("late").unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { from: ExecutionStatus::Completed, .. }));
    }

    #[test]
    fn test_skip_from_pending() {
        let mut e = entry(1, "branch");
        e.skip(ResultType::Superseded, Some("condition chose the other branch".into()))
            .unwrap();
        assert!(e.is_terminal());
        assert!(!e.is_interrupted());
    }

    #[test]
    fn test_record_versions_and_rejects_regression() {
        let mut log = ExecutionLog::new(SessionId::new("s1"));
        let mut e = entry(1, "ask");
        log.record(e.clone()).unwrap();
        e.start().unwrap();
        log.record(e.clone()).unwrap();
        e.complete(ResultType::Success).unwrap();
        log.record(e.clone()).unwrap();
        assert_eq!(log.len(), 1);

        let mut stale = entry(1, "ask");
        stale.start().unwrap();
        assert!(log.record(stale).is_err());
        assert_eq!(log.next_log_id(), LogId::new(2));
    }

    #[test]
    fn test_record_rejects_second_running_attempt() {
        let mut log = ExecutionLog::new(SessionId::new("s1"));
        let mut first = entry(1, "ask");
        first.start().unwrap();
        log.record(first).unwrap();

        let mut second = entry(2, "ask");
        second.start().unwrap();
        let err = log.record(second).unwrap_err();
        assert!(matches!(err, FlowError::ConcurrentExecution(_)));
    }

    #[test]
    fn test_from_entries_latest_version_wins() {
        let first = entry(1, "start");
        let mut running = first.clone();
        running.start().unwrap();
        let second = entry(2, "ask");

        let log = ExecutionLog::from_entries(
            SessionId::new("s1"),
            vec![first, second, running],
        );
        let order: Vec<_> = log.entries().map(|e| e.log_id.get()).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(log.get(LogId::new(1)).map(|e| e.status), Some(ExecutionStatus::Running));
        assert_eq!(
            log.find(&StepId::new("ask"), None, 0).map(|e| e.log_id),
            Some(LogId::new(2))
        );
    }

    #[test]
    fn test_find_follows_resumed_container() {
        let mut log = ExecutionLog::new(SessionId::new("s1"));
        let mut paused = entry(1, "rounds");
        paused.start().unwrap();
        log.record(paused.clone()).unwrap();

        let mut turn = StepExecution::pending(
            LogId::new(2),
            SessionId::new("s1"),
            StepId::new("turn"),
            Some(LogId::new(1)),
            0,
        );
        turn.start().unwrap();
        turn.complete(ResultType::Success).unwrap();
        log.record(turn).unwrap();

        paused
            .skip(ResultType::Interrupted, Some("session paused".into()))
            .unwrap();
        log.record(paused).unwrap();

        let mut resumed = entry(3, "rounds");
        resumed.resumes = Some(LogId::new(1));
        log.record(resumed).unwrap();

        let turn = StepId::new("turn");
        assert_eq!(
            log.find(&turn, Some(LogId::new(3)), 0).map(|e| e.log_id),
            Some(LogId::new(2))
        );
        assert!(log.find(&turn, Some(LogId::new(3)), 1).is_none());
        assert!(log.find(&turn, Some(LogId::new(9)), 0).is_none());
    }

    #[test]
    fn test_dialogue_payload_value() {
        let payload = DialoguePayload {
            role_id: RoleId::new("pro"),
            role_name: "Proponent".into(),
            content: "I agree".into(),
            output_variable: Some("answer".into()),
        };
        let value = payload.to_value();
        assert_eq!(value["role_id"], "pro");
        assert_eq!(DialoguePayload::from_value(&value), Some(payload));
    }
}
