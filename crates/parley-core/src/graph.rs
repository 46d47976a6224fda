//! The validated step tree of a flow.

use crate::error::FlowError;
use crate::step::{FlowId, Step, StepId, StepKind, StepType};
use crate::termination::TerminationRules;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A flow as stored: a flat list of steps linked by `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowId,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub termination: TerminationRules,
}

/// Builder for [`FlowDefinition`] that assigns step order automatically.
///
/// # Examples
///
/// ```
/// use parley_core::{DialogueConfig, FlowBuilder, Step, StepGraph};
///
/// let flow = FlowBuilder::new("interview")
///     .then(Step::start("start"))
///     .then(Step::repeat("rounds", 3))
///     .child("rounds", Step::dialogue("ask", DialogueConfig::fixed("host")))
///     .child("rounds", Step::dialogue("answer", DialogueConfig::fixed("guest")))
///     .then(Step::end("end"))
///     .build();
///
/// let graph = StepGraph::new(flow)?;
/// assert_eq!(graph.children_of(&"rounds".into())?.len(), 2);
/// # Ok::<(), parley_core::FlowError>(())
/// ```
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    id: FlowId,
    name: Option<String>,
    steps: Vec<Step>,
    termination: TerminationRules,
    next_order: HashMap<Option<StepId>, i32>,
}

impl FlowBuilder {
    pub fn new(id: impl Into<FlowId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
            termination: TerminationRules::default(),
            next_order: HashMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a root-level step.
    pub fn then(mut self, mut step: Step) -> Self {
        step.parent_id = None;
        step.order = self.bump(None);
        self.steps.push(step);
        self
    }

    /// Appends a step as the last child of `parent`.
    pub fn child(mut self, parent: impl Into<StepId>, mut step: Step) -> Self {
        let parent = parent.into();
        step.order = self.bump(Some(parent.clone()));
        step.parent_id = Some(parent);
        self.steps.push(step);
        self
    }

    /// Adds a step exactly as given.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn terminate_when(mut self, rules: TerminationRules) -> Self {
        self.termination = rules;
        self
    }

    pub fn build(self) -> FlowDefinition {
        FlowDefinition {
            id: self.id,
            name: self.name,
            steps: self.steps,
            termination: self.termination,
        }
    }

    fn bump(&mut self, parent: Option<StepId>) -> i32 {
        let slot = self.next_order.entry(parent).or_insert(0);
        *slot += 1;
        *slot
    }
}

/// A validated, read-only step tree.
///
/// Steps live in a flat arena indexed by id; children are kept as index
/// lists sorted by `order`. Share it across sessions behind an `Arc`.
#[derive(Debug, Clone)]
pub struct StepGraph {
    flow_id: FlowId,
    name: Option<String>,
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
    termination: TerminationRules,
}

impl StepGraph {
    /// Validates a definition.
    ///
    /// # Errors
    ///
    /// [`FlowError::Definition`] when the steps do not form a well-shaped
    /// tree: duplicate ids, dangling parents, cycles, a missing or
    /// misplaced start step, leaf steps with children, empty loop or
    /// parallel bodies, malformed condition branches, or no end step.
    pub fn new(definition: FlowDefinition) -> Result<Self, FlowError> {
        let FlowDefinition {
            id: flow_id,
            name,
            steps,
            termination,
        } = definition;

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(definition_error(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut children = vec![Vec::new(); steps.len()];
        let mut roots = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            match &step.parent_id {
                None => roots.push(i),
                Some(parent) => {
                    let p = index.get(parent).copied().ok_or_else(|| {
                        definition_error(format!(
                            "step '{}' references missing parent '{parent}'",
                            step.id
                        ))
                    })?;
                    children[p].push(i);
                }
            }
        }
        // stable sort keeps insertion order for equal `order` values
        roots.sort_by_key(|&i| steps[i].order);
        for list in &mut children {
            list.sort_by_key(|&i| steps[i].order);
        }

        let graph = Self {
            flow_id,
            name,
            steps,
            index,
            children,
            roots,
            termination,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), FlowError> {
        // Every step must be reachable from a root; anything else sits on a cycle.
        let mut seen = HashSet::with_capacity(self.steps.len());
        let mut stack: Vec<usize> = self.roots.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(&self.children[i]);
            }
        }
        if let Some(step) = self.steps.iter().enumerate().find(|(i, _)| !seen.contains(i)) {
            return Err(definition_error(format!(
                "step '{}' is its own ancestor",
                step.1.id
            )));
        }

        let starts: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.step_type() == StepType::Start)
            .collect();
        match starts.as_slice() {
            [] => return Err(definition_error("flow has no start step")),
            [start] => {
                let first = self.roots.first().map(|&i| &self.steps[i].id);
                if first != Some(&start.id) {
                    return Err(definition_error(format!(
                        "start step '{}' must be the first root step",
                        start.id
                    )));
                }
            }
            _ => return Err(definition_error("flow has more than one start step")),
        }

        for (i, step) in self.steps.iter().enumerate() {
            let kids = &self.children[i];
            match &step.kind {
                StepKind::Start | StepKind::End | StepKind::Wait | StepKind::Dialogue(_) => {
                    if !kids.is_empty() {
                        return Err(definition_error(format!(
                            "{} step '{}' cannot have children",
                            step.step_type(),
                            step.id
                        )));
                    }
                }
                StepKind::Loop(config) => {
                    if kids.is_empty() {
                        return Err(definition_error(format!(
                            "loop step '{}' has an empty body",
                            step.id
                        )));
                    }
                    if config.max_iterations == 0 {
                        return Err(definition_error(format!(
                            "loop step '{}' needs max_iterations of at least 1",
                            step.id
                        )));
                    }
                }
                StepKind::Parallel(_) => {
                    if kids.is_empty() {
                        return Err(definition_error(format!(
                            "parallel step '{}' has no branches",
                            step.id
                        )));
                    }
                    if let Some(end) = self
                        .subtree_indices(i)
                        .find(|&j| self.steps[j].step_type() == StepType::End)
                    {
                        return Err(definition_error(format!(
                            "end step '{}' cannot sit inside parallel step '{}'",
                            self.steps[end].id, step.id
                        )));
                    }
                }
                StepKind::Condition(config) => {
                    if config.when_true.is_empty() && config.when_false.is_empty() {
                        return Err(definition_error(format!(
                            "condition step '{}' has no branches",
                            step.id
                        )));
                    }
                    let direct: HashSet<&StepId> = kids.iter().map(|&k| &self.steps[k].id).collect();
                    for branch_id in config.when_true.iter().chain(&config.when_false) {
                        if !direct.contains(branch_id) {
                            return Err(definition_error(format!(
                                "condition step '{}' branches to '{branch_id}', which is not its child",
                                step.id
                            )));
                        }
                    }
                    for child in &direct {
                        let in_true = config.when_true.contains(*child);
                        let in_false = config.when_false.contains(*child);
                        if in_true == in_false {
                            return Err(definition_error(format!(
                                "child '{child}' of condition step '{}' must belong to exactly one branch",
                                step.id
                            )));
                        }
                    }
                }
            }
        }

        if !self.steps.iter().any(|s| s.step_type() == StepType::End) {
            return Err(definition_error("flow has no end step"));
        }
        Ok(())
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn termination(&self) -> &TerminationRules {
        &self.termination
    }

    /// # Errors
    ///
    /// [`FlowError::StepNotFound`] if the id is not part of the flow.
    pub fn resolve(&self, step_id: &StepId) -> Result<&Step, FlowError> {
        self.index
            .get(step_id)
            .map(|&i| &self.steps[i])
            .ok_or_else(|| FlowError::StepNotFound(step_id.clone()))
    }

    /// Children of a step, in execution order.
    pub fn children_of(&self, step_id: &StepId) -> Result<Vec<&Step>, FlowError> {
        let i = self
            .index
            .get(step_id)
            .copied()
            .ok_or_else(|| FlowError::StepNotFound(step_id.clone()))?;
        Ok(self.children[i].iter().map(|&c| &self.steps[c]).collect())
    }

    /// Root-level steps, in execution order.
    pub fn roots(&self) -> Vec<&Step> {
        self.roots.iter().map(|&i| &self.steps[i]).collect()
    }

    /// The step and all of its descendants, pre-order.
    pub fn subtree(&self, step_id: &StepId) -> Result<Vec<&Step>, FlowError> {
        let i = self
            .index
            .get(step_id)
            .copied()
            .ok_or_else(|| FlowError::StepNotFound(step_id.clone()))?;
        Ok(self.subtree_indices(i).map(|j| &self.steps[j]).collect())
    }

    /// All steps in definition order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn subtree_indices(&self, root: usize) -> impl Iterator<Item = usize> + '_ {
        let mut stack = vec![root];
        std::iter::from_fn(move || {
            let i = stack.pop()?;
            stack.extend(self.children[i].iter().rev());
            Some(i)
        })
    }
}

fn definition_error(message: impl Into<String>) -> FlowError {
    FlowError::Definition(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use crate::step::{DialogueConfig, JoinPolicy};

    fn expr(src: &str) -> Expression {
        Expression::parse(src).unwrap()
    }

    fn branching_flow() -> FlowDefinition {
        FlowBuilder::new("review")
            .then(Step::start("start"))
            .then(Step::dialogue("draft", DialogueConfig::fixed("writer")))
            .then(Step::condition(
                "check",
                expr("len(last_message) > 10"),
                vec!["revise".into()],
                vec!["stop".into()],
            ))
            .child("check", Step::dialogue("revise", DialogueConfig::fixed("editor")))
            .child("check", Step::end("stop"))
            .then(Step::end("end"))
            .build()
    }

    fn definition_message(result: Result<StepGraph, FlowError>) -> String {
        match result {
            Err(FlowError::Definition(message)) => message,
            other => panic!("expected a definition error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_graph_navigation() {
        let graph = StepGraph::new(branching_flow()).unwrap();
        let roots: Vec<_> = graph.roots().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(roots, vec!["start", "draft", "check", "end"]);

        let kids: Vec<_> = graph
            .children_of(&"check".into())
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(kids, vec!["revise", "stop"]);
        assert_eq!(graph.subtree(&"check".into()).unwrap().len(), 3);
        assert!(matches!(
            graph.resolve(&"nope".into()),
            Err(FlowError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_children_sorted_by_order() {
        let def = FlowBuilder::new("f")
            .step(Step::start("start"))
            .step(Step::repeat("loop", 2).at(1))
            .step(Step::wait("second").under("loop").at(2))
            .step(Step::wait("first").under("loop").at(1))
            .step(Step::end("end").at(2))
            .build();
        let graph = StepGraph::new(def).unwrap();
        let kids: Vec<_> = graph
            .children_of(&"loop".into())
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(kids, vec!["first", "second"]);
    }

    #[test]
    fn test_missing_parent() {
        let def = FlowBuilder::new("f")
            .then(Step::start("start"))
            .step(Step::wait("orphan").under("ghost"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(def)).contains("missing parent 'ghost'"));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = FlowBuilder::new("f")
            .then(Step::start("start"))
            .step(Step::repeat("a", 2).under("b"))
            .step(Step::repeat("b", 2).under("a"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(def)).contains("own ancestor"));
    }

    #[test]
    fn test_empty_loop_and_zero_bound() {
        let empty = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::repeat("loop", 2))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(empty)).contains("empty body"));

        let zero = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::repeat("loop", 0))
            .child("loop", Step::wait("w"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(zero)).contains("max_iterations"));
    }

    #[test]
    fn test_condition_branch_rules() {
        let no_branches = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::condition("c", expr("true"), vec![], vec![]))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(no_branches)).contains("no branches"));

        let unassigned = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::condition("c", expr("true"), vec!["a".into()], vec![]))
            .child("c", Step::wait("a"))
            .child("c", Step::wait("b"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(unassigned)).contains("exactly one branch"));

        let foreign = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::condition("c", expr("true"), vec!["end".into()], vec![]))
            .child("c", Step::wait("a"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(foreign)).contains("not its child"));
    }

    #[test]
    fn test_start_and_end_rules() {
        let no_end = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::wait("w"))
            .build();
        assert!(definition_message(StepGraph::new(no_end)).contains("no end step"));

        let late_start = FlowBuilder::new("f")
            .then(Step::wait("w"))
            .then(Step::start("start"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(late_start)).contains("first root step"));

        let two_starts = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::start("again"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(two_starts)).contains("more than one"));
    }

    #[test]
    fn test_leaf_children_and_parallel_end() {
        let leaf = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::wait("w"))
            .child("w", Step::wait("inner"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(leaf)).contains("cannot have children"));

        let parallel_end = FlowBuilder::new("f")
            .then(Step::start("start"))
            .then(Step::parallel("fan", JoinPolicy::All))
            .child("fan", Step::end("early"))
            .then(Step::end("end"))
            .build();
        assert!(definition_message(StepGraph::new(parallel_end)).contains("inside parallel"));
    }

    #[test]
    fn test_definition_from_json() {
        let def: FlowDefinition = serde_json::from_value(serde_json::json!({
            "id": "debate",
            "steps": [
                { "id": "start", "kind": { "type": "start" } },
                { "id": "talk", "order": 1, "kind": { "type": "dialogue", "speaker": { "fixed": "pro" } } },
                { "id": "end", "order": 2, "kind": { "type": "end" } }
            ],
            "termination": { "max_rounds": 4 }
        }))
        .unwrap();
        let graph = StepGraph::new(def).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.termination().max_rounds, Some(4));
    }
}
