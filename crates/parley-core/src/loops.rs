//! Iteration counters for active loop steps.

use crate::error::FlowError;
use crate::step::StepId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopState {
    iteration: u32,
    max_iterations: u32,
    exit_requested: bool,
}

/// Tracks one counter per active loop step.
///
/// Nested loops keep independent counters keyed by step id. A loop that is
/// entered while already active is rejected.
///
/// # Examples
///
/// ```
/// use parley_core::{LoopController, StepId};
///
/// let mut loops = LoopController::default();
/// let id = StepId::new("debate");
/// assert_eq!(loops.enter(&id, 2)?, 0);
/// assert!(loops.should_continue(&id));
/// loops.advance(&id);
/// loops.advance(&id);
/// assert!(!loops.should_continue(&id));
/// assert_eq!(loops.exit(&id), Some(2));
/// # Ok::<(), parley_core::FlowError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoopController {
    active: HashMap<StepId, LoopState>,
}

impl LoopController {
    /// Activates a loop and returns its first iteration index.
    ///
    /// # Errors
    ///
    /// [`FlowError::Definition`] if the loop is already active.
    pub fn enter(&mut self, loop_id: &StepId, max_iterations: u32) -> Result<u32, FlowError> {
        if self.active.contains_key(loop_id) {
            return Err(FlowError::Definition(format!(
                "loop '{loop_id}' re-entered while still active"
            )));
        }
        self.active.insert(
            loop_id.clone(),
            LoopState {
                iteration: 0,
                max_iterations,
                exit_requested: false,
            },
        );
        Ok(0)
    }

    /// False once the bound is reached or an exit was requested.
    pub fn should_continue(&self, loop_id: &StepId) -> bool {
        self.active
            .get(loop_id)
            .is_some_and(|s| !s.exit_requested && s.iteration < s.max_iterations)
    }

    pub fn bound_reached(&self, loop_id: &StepId) -> bool {
        self.active
            .get(loop_id)
            .is_some_and(|s| s.iteration >= s.max_iterations)
    }

    /// Marks the loop for exit after the current pass.
    pub fn request_exit(&mut self, loop_id: &StepId) {
        if let Some(state) = self.active.get_mut(loop_id) {
            state.exit_requested = true;
        }
    }

    pub fn exit_requested(&self, loop_id: &StepId) -> bool {
        self.active.get(loop_id).is_some_and(|s| s.exit_requested)
    }

    /// Finishes a pass and returns the next iteration index.
    pub fn advance(&mut self, loop_id: &StepId) -> Option<u32> {
        let state = self.active.get_mut(loop_id)?;
        state.iteration = state.iteration.saturating_add(1);
        Some(state.iteration)
    }

    pub fn iteration(&self, loop_id: &StepId) -> Option<u32> {
        self.active.get(loop_id).map(|s| s.iteration)
    }

    /// Clears the counter and returns the number of finished passes.
    pub fn exit(&mut self, loop_id: &StepId) -> Option<u32> {
        self.active.remove(loop_id).map(|s| s.iteration)
    }

    /// Current counters of every active loop.
    pub fn counters(&self) -> BTreeMap<StepId, u32> {
        self.active
            .iter()
            .map(|(id, s)| (id.clone(), s.iteration))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentry_is_a_definition_error() {
        let mut loops = LoopController::default();
        let id = StepId::new("outer");
        loops.enter(&id, 3).unwrap();
        assert!(matches!(loops.enter(&id, 3), Err(FlowError::Definition(_))));
        loops.exit(&id);
        assert_eq!(loops.enter(&id, 3).unwrap(), 0);
    }

    #[test]
    fn test_nested_loops_are_independent() {
        let mut loops = LoopController::default();
        let outer = StepId::new("outer");
        let inner = StepId::new("inner");
        loops.enter(&outer, 2).unwrap();
        loops.advance(&outer);
        loops.enter(&inner, 5).unwrap();
        loops.advance(&inner);
        loops.advance(&inner);

        assert_eq!(loops.iteration(&outer), Some(1));
        assert_eq!(loops.iteration(&inner), Some(2));
        assert_eq!(loops.counters().len(), 2);
        assert_eq!(loops.exit(&inner), Some(2));
        assert!(loops.should_continue(&outer));
    }

    #[test]
    fn test_exit_request_stops_before_bound() {
        let mut loops = LoopController::default();
        let id = StepId::new("debate");
        loops.enter(&id, 10).unwrap();
        loops.request_exit(&id);
        loops.advance(&id);
        assert!(!loops.should_continue(&id));
        assert!(!loops.bound_reached(&id));
        assert!(loops.exit_requested(&id));
    }
}
