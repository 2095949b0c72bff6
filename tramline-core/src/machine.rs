use crate::error::{EngineError, EngineResult};
use crate::types::{FlowNodeInstance, StateCategory, StateId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Successor lookup for one `(state, category)` pair. Pure: the same
/// pair always yields the same successor. `None` means the pair has no
/// transition: either the state is terminal or the caller consulted
/// the wrong table.
pub fn next_state_for(state: StateId, category: StateCategory) -> Option<StateId> {
    match category {
        StateCategory::Normal => match state {
            StateId::Initializing => Some(StateId::Ready),
            StateId::Ready => Some(StateId::Executing),
            StateId::Executing => Some(StateId::Completing),
            StateId::Waiting => Some(StateId::Executing),
            StateId::Completing => Some(StateId::Completed),
            StateId::Failed => Some(StateId::Executing),
            _ => None,
        },
        StateCategory::Aborting => match state {
            StateId::Initializing
            | StateId::Ready
            | StateId::Executing
            | StateId::Waiting
            | StateId::Completing
            | StateId::Failed => Some(StateId::Aborting),
            StateId::Aborting => Some(StateId::Aborted),
            _ => None,
        },
        StateCategory::Cancelling => match state {
            StateId::Initializing
            | StateId::Ready
            | StateId::Executing
            | StateId::Waiting
            | StateId::Completing
            | StateId::Failed => Some(StateId::Cancelling),
            StateId::Cancelling => Some(StateId::Cancelled),
            _ => None,
        },
    }
}

pub struct FlowNodeStateMachine;

impl FlowNodeStateMachine {
    /// Next state for a live flow node, or `IllegalStateTransition`
    /// carrying the terminal flag so callers can tell an expected
    /// no-successor apart from a genuine missing-transition bug.
    pub fn next_state(node: &FlowNodeInstance) -> EngineResult<StateId> {
        next_state_for(node.state, node.category).ok_or_else(|| {
            EngineError::IllegalStateTransition {
                state: node.state,
                category: node.category,
                node_type: node.node_type,
                node_id: node.id,
                terminal: node.state.is_terminal(),
            }
        })
    }
}

/// Lifecycle hooks invoked by the executor while a node occupies a
/// state. The real work (connectors, operations) is layered around
/// these by the executor; the default hooks do nothing.
#[async_trait]
pub trait StateBehavior: Send + Sync {
    fn id(&self) -> StateId;

    async fn before_on_enter(&self, _node: &FlowNodeInstance) -> EngineResult<()> {
        Ok(())
    }

    /// The body of the state.
    async fn on_enter_to_on_finish(&self, _node: &FlowNodeInstance) -> EngineResult<()> {
        Ok(())
    }

    async fn after_on_finish(&self, _node: &FlowNodeInstance) -> EngineResult<()> {
        Ok(())
    }
}

/// The concrete NORMAL-category executing state: not terminal, not
/// stable, not interrupting, no-op hooks.
pub struct ExecutingState;

#[async_trait]
impl StateBehavior for ExecutingState {
    fn id(&self) -> StateId {
        StateId::Executing
    }
}

struct DefaultBehavior(StateId);

#[async_trait]
impl StateBehavior for DefaultBehavior {
    fn id(&self) -> StateId {
        self.0
    }
}

/// Behavior lookup, one entry per state. Built at executor
/// construction; tests swap entries to observe hook ordering.
pub struct StateRegistry {
    behaviors: HashMap<StateId, Arc<dyn StateBehavior>>,
}

impl StateRegistry {
    pub fn standard() -> Self {
        let mut behaviors: HashMap<StateId, Arc<dyn StateBehavior>> = HashMap::new();
        behaviors.insert(StateId::Executing, Arc::new(ExecutingState));
        for state in [
            StateId::Initializing,
            StateId::Ready,
            StateId::Waiting,
            StateId::Completing,
            StateId::Completed,
            StateId::Aborting,
            StateId::Aborted,
            StateId::Cancelling,
            StateId::Cancelled,
            StateId::Failed,
        ] {
            behaviors.insert(state, Arc::new(DefaultBehavior(state)));
        }
        Self { behaviors }
    }

    pub fn register(&mut self, behavior: Arc<dyn StateBehavior>) {
        self.behaviors.insert(behavior.id(), behavior);
    }

    pub fn behavior(&self, state: StateId) -> Arc<dyn StateBehavior> {
        self.behaviors
            .get(&state)
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultBehavior(state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowNodeType;
    use uuid::Uuid;

    fn node(state: StateId, category: StateCategory) -> FlowNodeInstance {
        FlowNodeInstance {
            id: Uuid::now_v7(),
            definition_id: "step".into(),
            name: "step".into(),
            node_type: FlowNodeType::AutomaticTask,
            state,
            category,
            parent_flow_node_id: None,
            process_instance_id: Uuid::now_v7(),
            root_process_instance_id: Uuid::now_v7(),
        }
    }

    #[test]
    fn normal_path_reaches_completed() {
        let mut state = StateId::Initializing;
        let mut seen = vec![state];
        while let Some(next) = next_state_for(state, StateCategory::Normal) {
            // Waiting -> Executing would loop; the walk below never
            // enters Waiting from the initializing chain.
            state = next;
            seen.push(state);
            if state.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                StateId::Initializing,
                StateId::Ready,
                StateId::Executing,
                StateId::Completing,
                StateId::Completed,
            ]
        );
    }

    #[test]
    fn lookup_is_pure() {
        for _ in 0..3 {
            assert_eq!(
                next_state_for(StateId::Executing, StateCategory::Normal),
                Some(StateId::Completing)
            );
        }
    }

    #[test]
    fn terminal_state_has_no_successor_in_any_table() {
        for category in [
            StateCategory::Normal,
            StateCategory::Aborting,
            StateCategory::Cancelling,
        ] {
            assert_eq!(next_state_for(StateId::Completed, category), None);
            assert_eq!(next_state_for(StateId::Aborted, category), None);
            assert_eq!(next_state_for(StateId::Cancelled, category), None);
        }
    }

    #[test]
    fn terminal_lookup_fails_with_terminal_flag() {
        let err = FlowNodeStateMachine::next_state(&node(
            StateId::Completed,
            StateCategory::Normal,
        ))
        .unwrap_err();
        match err {
            EngineError::IllegalStateTransition { terminal, .. } => assert!(terminal),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_table_lookup_fails_without_terminal_flag() {
        // Aborting is a live state but belongs to the aborting table;
        // looking it up under Normal is a caller error.
        let err = FlowNodeStateMachine::next_state(&node(
            StateId::Aborting,
            StateCategory::Normal,
        ))
        .unwrap_err();
        match err {
            EngineError::IllegalStateTransition { terminal, .. } => assert!(!terminal),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn aborting_table_routes_every_live_state_to_aborted() {
        let mut state = StateId::Executing;
        state = next_state_for(state, StateCategory::Aborting).unwrap();
        assert_eq!(state, StateId::Aborting);
        state = next_state_for(state, StateCategory::Aborting).unwrap();
        assert_eq!(state, StateId::Aborted);
    }

    #[tokio::test]
    async fn executing_state_hooks_are_noops() {
        let behavior = ExecutingState;
        let n = node(StateId::Executing, StateCategory::Normal);
        assert_eq!(behavior.id(), StateId::Executing);
        assert!(!StateId::Executing.is_terminal());
        assert!(!StateId::Executing.is_stable());
        assert!(!StateId::Executing.is_interrupting());
        behavior.before_on_enter(&n).await.unwrap();
        behavior.on_enter_to_on_finish(&n).await.unwrap();
        behavior.after_on_finish(&n).await.unwrap();
    }
}
