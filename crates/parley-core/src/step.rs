//! Step definitions.

use crate::expression::Expression;
use serde::{Deserialize, Serialize};
use std::fmt;

string_id!(
    /// Identifier of a step within a flow.
    StepId
);

string_id!(
    /// Identifier of a flow template.
    FlowId
);

/// The seven step types a flow is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    End,
    Dialogue,
    Condition,
    Loop,
    Wait,
    Parallel,
}

impl StepType {
    /// Returns `true` for types that may own child steps.
    pub fn is_container(self) -> bool {
        matches!(self, StepType::Condition | StepType::Loop | StepType::Parallel)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Start => "start",
            StepType::End => "end",
            StepType::Dialogue => "dialogue",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Wait => "wait",
            StepType::Parallel => "parallel",
        };
        f.write_str(name)
    }
}

/// Type-specific step configuration.
///
/// A closed union: adding a step type means extending every `match` on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Start,
    End,
    Dialogue(DialogueConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    Wait,
    Parallel(ParallelConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Start => StepType::Start,
            StepKind::End => StepType::End,
            StepKind::Dialogue(_) => StepType::Dialogue,
            StepKind::Condition(_) => StepType::Condition,
            StepKind::Loop(_) => StepType::Loop,
            StepKind::Wait => StepType::Wait,
            StepKind::Parallel(_) => StepType::Parallel,
        }
    }
}

/// Which role speaks at a dialogue step.
///
/// Values are role *references*; a session may bind a reference to a
/// concrete role id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleAssignment {
    /// Always the same role.
    Fixed(String),
    /// Rotates through the list by the current loop iteration.
    RoundRobin(Vec<String>),
    /// Reads the role reference from a context variable.
    FromVariable(String),
}

/// Which part of the message history a dialogue step sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// No history.
    None,
    /// Only the latest message.
    LastMessage,
    /// The most recent N messages; `None` uses the engine default.
    Recent(Option<usize>),
    /// The whole history.
    All,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        ContextPolicy::Recent(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueConfig {
    pub speaker: RoleAssignment,
    /// Role the reply is addressed to.
    #[serde(default)]
    pub target: Option<String>,
    /// Task description appended to the role prompt.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub context: ContextPolicy,
    /// Stores the generated text under this variable name.
    #[serde(default)]
    pub output_variable: Option<String>,
    /// Overrides the engine's generation timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the engine's retry cap.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl DialogueConfig {
    /// A dialogue spoken by a single role with default settings.
    pub fn fixed(role: impl Into<String>) -> Self {
        Self::new(RoleAssignment::Fixed(role.into()))
    }

    pub fn new(speaker: RoleAssignment) -> Self {
        Self {
            speaker,
            target: None,
            task: None,
            context: ContextPolicy::default(),
            output_variable: None,
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn with_target(mut self, role: impl Into<String>) -> Self {
        self.target = Some(role.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_context(mut self, policy: ContextPolicy) -> Self {
        self.context = policy;
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Branch selection. Both lists name direct children of the condition
/// step; every child belongs to exactly one list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub expression: Expression,
    #[serde(default)]
    pub when_true: Vec<StepId>,
    #[serde(default)]
    pub when_false: Vec<StepId>,
}

/// Bounded repetition over the loop step's children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Checked after every pass; a true result ends the loop early.
    #[serde(default)]
    pub exit_when: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every branch; fail if any branch fails.
    #[default]
    All,
    /// Finish with the first completed branch; skip the rest.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default)]
    pub join: JoinPolicy,
}

/// One node of a flow tree.
///
/// # Examples
///
/// ```
/// use parley_core::{DialogueConfig, Step, StepType};
///
/// let step = Step::dialogue("opening", DialogueConfig::fixed("host")).named("Opening remarks");
/// assert_eq!(step.step_type(), StepType::Dialogue);
/// assert_eq!(step.display_name(), "Opening remarks");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub parent_id: Option<StepId>,
    /// A failure inside this step's subtree does not fail the session.
    #[serde(default)]
    pub optional: bool,
    pub kind: StepKind,
}

impl Step {
    pub fn new(id: impl Into<StepId>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            order: 0,
            parent_id: None,
            optional: false,
            kind,
        }
    }

    pub fn start(id: impl Into<StepId>) -> Self {
        Self::new(id, StepKind::Start)
    }

    pub fn end(id: impl Into<StepId>) -> Self {
        Self::new(id, StepKind::End)
    }

    pub fn wait(id: impl Into<StepId>) -> Self {
        Self::new(id, StepKind::Wait)
    }

    pub fn dialogue(id: impl Into<StepId>, config: DialogueConfig) -> Self {
        Self::new(id, StepKind::Dialogue(config))
    }

    pub fn condition(
        id: impl Into<StepId>,
        expression: Expression,
        when_true: Vec<StepId>,
        when_false: Vec<StepId>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition(ConditionConfig {
                expression,
                when_true,
                when_false,
            }),
        )
    }

    pub fn repeat(id: impl Into<StepId>, max_iterations: u32) -> Self {
        Self::new(
            id,
            StepKind::Loop(LoopConfig {
                max_iterations,
                exit_when: None,
            }),
        )
    }

    pub fn parallel(id: impl Into<StepId>, join: JoinPolicy) -> Self {
        Self::new(id, StepKind::Parallel(ParallelConfig { join }))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn at(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn under(mut self, parent: impl Into<StepId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the early-exit expression of a loop step. No-op on other types.
    pub fn exit_when(mut self, expression: Expression) -> Self {
        if let StepKind::Loop(config) = &mut self.kind {
            config.exit_when = Some(expression);
        }
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// The step name, falling back to its id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_from_json() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "ask",
            "order": 2,
            "kind": {
                "type": "dialogue",
                "speaker": { "round_robin": ["pro", "con"] },
                "context": "last_message",
                "max_retries": 1
            }
        }))
        .expect("valid step");

        assert_eq!(step.step_type(), StepType::Dialogue);
        assert_eq!(step.order, 2);
        match step.kind {
            StepKind::Dialogue(config) => {
                assert_eq!(
                    config.speaker,
                    RoleAssignment::RoundRobin(vec!["pro".into(), "con".into()])
                );
                assert_eq!(config.context, ContextPolicy::LastMessage);
                assert_eq!(config.max_retries, Some(1));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_loop_exit_expression() {
        let step = Step::repeat("debate", 3)
            .exit_when(Expression::parse("agreed == true").expect("valid expression"));
        match &step.kind {
            StepKind::Loop(config) => {
                assert_eq!(config.max_iterations, 3);
                assert!(config.exit_when.is_some());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_step_type_display() {
        assert_eq!(StepType::Parallel.to_string(), "parallel");
        assert!(StepType::Loop.is_container());
        assert!(!StepType::Dialogue.is_container());
    }
}
