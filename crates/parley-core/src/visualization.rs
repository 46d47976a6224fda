//! Read-models for monitoring consumers.
//!
//! Both structures are derived from a [`StepGraph`], an [`ExecutionLog`]
//! snapshot and the session record alone, so building them never touches
//! engine state.

use crate::context::{SessionId, SessionStatus};
use crate::graph::StepGraph;
use crate::log::{ExecutionLog, ExecutionStatus, StepExecution};
use crate::session::SessionRecord;
use crate::step::{FlowId, Step, StepId, StepType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One step of the flow tree with its execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    pub id: StepId,
    pub name: String,
    pub step_type: StepType,
    pub order: i32,
    pub executions: Vec<StepExecution>,
    pub children: Vec<StepNode>,
    pub is_loop: bool,
    pub is_condition: bool,
    /// Latest branch decision of a condition step.
    pub condition_result: Option<bool>,
    /// Latest pass count of a loop step.
    pub loop_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVisualizationData {
    pub session_id: SessionId,
    pub flow_template_id: FlowId,
    pub current_step_id: Option<StepId>,
    pub session_status: SessionStatus,
    pub total_steps: usize,
    /// Steps with at least one completed execution.
    pub completed_steps: usize,
    pub steps: Vec<StepNode>,
}

impl FlowVisualizationData {
    pub fn build(graph: &StepGraph, log: &ExecutionLog, record: &SessionRecord) -> Self {
        let completed: HashSet<&StepId> = log
            .entries()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .map(|e| &e.step_id)
            .collect();

        Self {
            session_id: record.session_id.clone(),
            flow_template_id: graph.flow_id().clone(),
            current_step_id: record.current_step_id.clone(),
            session_status: record.status,
            total_steps: graph.len(),
            completed_steps: completed.len(),
            steps: graph
                .roots()
                .into_iter()
                .map(|step| node(graph, log, step))
                .collect(),
        }
    }

    /// Depth-first search for a node.
    pub fn find(&self, step_id: &StepId) -> Option<&StepNode> {
        fn walk<'a>(nodes: &'a [StepNode], id: &StepId) -> Option<&'a StepNode> {
            nodes
                .iter()
                .find_map(|n| if &n.id == id { Some(n) } else { walk(&n.children, id) })
        }
        walk(&self.steps, step_id)
    }
}

fn node(graph: &StepGraph, log: &ExecutionLog, step: &Step) -> StepNode {
    let executions: Vec<StepExecution> = log.for_step(&step.id).cloned().collect();
    let children = graph
        .children_of(&step.id)
        .map(|kids| kids.into_iter().map(|c| node(graph, log, c)).collect())
        .unwrap_or_default();

    StepNode {
        id: step.id.clone(),
        name: step.display_name().to_string(),
        step_type: step.step_type(),
        order: step.order,
        condition_result: executions.iter().rev().find_map(|e| e.condition_result),
        loop_count: executions.iter().rev().find_map(|e| e.loop_count),
        executions,
        children,
        is_loop: step.step_type() == StepType::Loop,
        is_condition: step.step_type() == StepType::Condition,
    }
}

/// Per-session execution statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timeout: usize,
    /// Share of entries in a terminal status, 0 to 100.
    pub progress_percent: f64,
    pub total_duration_ms: u64,
    pub average_duration_ms: Option<f64>,
}

impl ExecutionSummary {
    pub fn from_log(log: &ExecutionLog) -> Self {
        let mut summary = Self::default();
        let mut timed = 0u64;
        for entry in log.entries() {
            summary.total += 1;
            match entry.status {
                ExecutionStatus::Pending => summary.pending += 1,
                ExecutionStatus::Running => summary.running += 1,
                ExecutionStatus::Completed => summary.completed += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                ExecutionStatus::Skipped => summary.skipped += 1,
                ExecutionStatus::Timeout => summary.timeout += 1,
            }
            if entry.status == ExecutionStatus::Completed {
                if let Some(ms) = entry.duration_ms {
                    summary.total_duration_ms += ms;
                    timed += 1;
                }
            }
        }
        if summary.total > 0 {
            let finished = summary.total - summary.pending - summary.running;
            summary.progress_percent = finished as f64 * 100.0 / summary.total as f64;
        }
        if timed > 0 {
            summary.average_duration_ms = Some(summary.total_duration_ms as f64 / timed as f64);
        }
        summary
    }
}
