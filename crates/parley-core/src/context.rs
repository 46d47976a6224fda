//! Per-session runtime state.

use crate::log::{DialoguePayload, ExecutionLog, ExecutionStatus};
use crate::loops::LoopController;
use crate::session::SessionRecord;
use crate::step::{ContextPolicy, StepId};
use crate::traits::RoleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

string_id!(
    /// Identifier of a dialogue session.
    SessionId
);

/// Maximum length of [`Message::summary`], in characters.
pub const SUMMARY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl SessionStatus {
    /// Completed and failed sessions are never advanced again.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// One generated turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub step_id: StepId,
    pub role_id: RoleId,
    pub role_name: String,
    pub content: String,
    /// Round this message completed; 1 for the first dialogue turn.
    pub round_index: u32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        step_id: StepId,
        role_id: RoleId,
        role_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            step_id,
            role_id,
            role_name: role_name.into(),
            content: content.into(),
            round_index: 0,
            created_at: Utc::now(),
        }
    }

    /// Content shortened to [`SUMMARY_LIMIT`] characters.
    pub fn summary(&self) -> String {
        if self.content.chars().count() <= SUMMARY_LIMIT {
            return self.content.clone();
        }
        let mut summary: String = self.content.chars().take(SUMMARY_LIMIT - 3).collect();
        summary.push_str("...");
        summary
    }
}

/// Runtime state of one session.
///
/// Owned by the engine task advancing the session; nothing here is shared
/// across sessions.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    session_id: SessionId,
    current_step_id: Option<StepId>,
    session_status: SessionStatus,
    message_history: Vec<Message>,
    loops: LoopController,
    variables: HashMap<String, Value>,
    rounds: u32,
}

impl ExecutionContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            current_step_id: None,
            session_status: SessionStatus::Pending,
            message_history: Vec::new(),
            loops: LoopController::default(),
            variables: HashMap::new(),
            rounds: 0,
        }
    }

    /// Seeds a context from the stored session record only.
    pub fn for_session(record: &SessionRecord) -> Self {
        let mut ctx = Self::new(record.session_id.clone());
        ctx.session_status = record.status;
        ctx.current_step_id = record.current_step_id.clone();
        ctx.variables = record.variables.clone();
        ctx
    }

    /// Rebuilds the conversation state of a session from its log.
    ///
    /// Every completed dialogue entry contributes its message and output
    /// variable. Loop counters are not rebuilt.
    pub fn from_log(record: &SessionRecord, log: &ExecutionLog) -> Self {
        let mut ctx = Self::for_session(record);
        for entry in log.entries() {
            if entry.status != ExecutionStatus::Completed {
                continue;
            }
            let Some(payload) = entry.result_payload.as_ref().and_then(DialoguePayload::from_value)
            else {
                continue;
            };
            ctx.replay_dialogue(entry.step_id.clone(), entry.round_index, payload);
        }
        ctx
    }

    /// Applies the effects of an already completed dialogue attempt.
    pub fn replay_dialogue(&mut self, step_id: StepId, round_index: u32, payload: DialoguePayload) {
        if let Some(var) = &payload.output_variable {
            self.set_variable(var.clone(), Value::String(payload.content.clone()));
        }
        let mut message = Message::new(step_id, payload.role_id, payload.role_name, payload.content);
        message.round_index = round_index;
        self.restore_message(message);
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn current_step_id(&self) -> Option<&StepId> {
        self.current_step_id.as_ref()
    }

    pub fn set_current_step(&mut self, step_id: StepId) {
        self.current_step_id = Some(step_id);
    }

    pub fn status(&self) -> SessionStatus {
        self.session_status
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.session_status = status;
    }

    pub fn message_history(&self) -> &[Message] {
        &self.message_history
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.message_history.last()
    }

    /// Number of completed dialogue rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Appends the message of a completed dialogue step and returns its
    /// round index.
    pub fn complete_round(&mut self, mut message: Message) -> u32 {
        self.rounds = self.rounds.saturating_add(1);
        message.round_index = self.rounds;
        self.message_history.push(message);
        self.rounds
    }

    /// Inserts a message recovered from the log, keeping round order.
    pub fn restore_message(&mut self, message: Message) {
        let at = self
            .message_history
            .partition_point(|m| m.round_index <= message.round_index);
        self.rounds = self.rounds.max(message.round_index);
        self.message_history.insert(at, message);
    }

    pub fn loops(&self) -> &LoopController {
        &self.loops
    }

    pub fn loops_mut(&mut self) -> &mut LoopController {
        &mut self.loops
    }

    pub fn loop_counters(&self) -> BTreeMap<StepId, u32> {
        self.loops.counters()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Messages visible to a dialogue step under `policy`.
    pub fn window(&self, policy: ContextPolicy, default_n: usize) -> Vec<Message> {
        let take = match policy {
            ContextPolicy::None => 0,
            ContextPolicy::LastMessage => 1,
            ContextPolicy::Recent(n) => n.unwrap_or(default_n),
            ContextPolicy::All => self.message_history.len(),
        };
        let skip = self.message_history.len().saturating_sub(take);
        self.message_history[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogId, ResultType, StepExecution};
    use crate::step::FlowId;

    fn message(content: &str) -> Message {
        Message::new(StepId::new("talk"), RoleId::new("host"), "Host", content)
    }

    #[test]
    fn test_rounds_increase_per_completion() {
        let mut ctx = ExecutionContext::new(SessionId::new("s1"));
        assert_eq!(ctx.complete_round(message("a")), 1);
        assert_eq!(ctx.complete_round(message("b")), 2);
        assert_eq!(ctx.rounds(), 2);
        assert_eq!(ctx.last_message().map(|m| m.round_index), Some(2));
    }

    #[test]
    fn test_window_policies() {
        let mut ctx = ExecutionContext::new(SessionId::new("s1"));
        for c in ["a", "b", "c", "d"] {
            ctx.complete_round(message(c));
        }
        let contents = |v: Vec<Message>| v.into_iter().map(|m| m.content).collect::<Vec<_>>();
        assert!(ctx.window(ContextPolicy::None, 10).is_empty());
        assert_eq!(contents(ctx.window(ContextPolicy::LastMessage, 10)), vec!["d"]);
        assert_eq!(contents(ctx.window(ContextPolicy::Recent(None), 2)), vec!["c", "d"]);
        assert_eq!(contents(ctx.window(ContextPolicy::Recent(Some(3)), 2)), vec!["b", "c", "d"]);
        assert_eq!(ctx.window(ContextPolicy::All, 1).len(), 4);
    }

    #[test]
    fn test_summary_truncates_on_char_boundary() {
        let short = message("short");
        assert_eq!(short.summary(), "short");

        let long = message(&"é".repeat(150));
        let summary = long.summary();
        assert_eq!(summary.chars().count(), SUMMARY_LIMIT);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_restore_keeps_round_order() {
        let mut ctx = ExecutionContext::new(SessionId::new("s1"));
        let mut second = message("second");
        second.round_index = 2;
        let mut first = message("first");
        first.round_index = 1;
        ctx.restore_message(second);
        ctx.restore_message(first);
        assert_eq!(ctx.message_history()[0].content, "first");
        assert_eq!(ctx.rounds(), 2);
        assert_eq!(ctx.complete_round(message("third")), 3);
    }

    #[test]
    fn test_from_log_rebuilds_messages_and_variables() {
        let session_id = SessionId::new("s1");
        let record = SessionRecord::new(session_id.clone(), FlowId::new("debate"));
        let mut entry = StepExecution::pending(
            LogId::new(2),
            session_id.clone(),
            StepId::new("opening"),
            None,
            0,
        );
        entry.start().unwrap();
        entry.round_index = 1;
        entry.result_payload = Some(
            DialoguePayload {
                role_id: RoleId::new("pro"),
                role_name: "Pro".into(),
                content: "Opening statement".into(),
                output_variable: Some("opening".into()),
            }
            .to_value(),
        );
        entry.complete(ResultType::Success).unwrap();

        let log = ExecutionLog::from_entries(session_id, vec![entry]);
        let ctx = ExecutionContext::from_log(&record, &log);
        assert_eq!(ctx.rounds(), 1);
        assert_eq!(ctx.message_history()[0].role_id, RoleId::new("pro"));
        assert_eq!(
            ctx.variable("opening"),
            Some(&Value::String("Opening statement".into()))
        );
    }
}
