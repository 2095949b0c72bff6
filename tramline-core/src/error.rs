use crate::types::{FlowNodeType, StateCategory, StateId};
use thiserror::Error;
use uuid::Uuid;

/// Engine error taxonomy. Callers branch on [`EngineError::staleness`]
/// instead of inspecting nested causes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow node instance not found: {0}")]
    FlowNodeNotFound(Uuid),

    #[error("process instance not found: {0}")]
    ProcessInstanceNotFound(Uuid),

    #[error("process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    #[error(
        "no transition from state {state:?} in category {category:?} \
         for {node_type:?} node {node_id} (terminal: {terminal})"
    )]
    IllegalStateTransition {
        state: StateId,
        category: StateCategory,
        node_type: FlowNodeType,
        node_id: Uuid,
        terminal: bool,
    },

    /// Read failure while matching events; retryable.
    #[error("event read failed: {0}")]
    EventRead(String),

    /// Waiter already consumed; someone else got there first.
    #[error("waiting event not found: {0}")]
    EventNotFound(Uuid),

    #[error("operation execution failed: {0}")]
    OperationExecution(String),

    /// A definition names a connector nobody registered; a
    /// configuration error, never retryable.
    #[error("no connector registered under id '{0}'")]
    ConnectorNotFound(String),

    #[error("expression evaluation failed: {0}")]
    Evaluation(String),

    #[error("work queue saturated; scale executor capacity")]
    SchedulerSaturated,

    #[error("work scheduler is shut down")]
    SchedulerShutDown,

    #[error("store failure: {0}")]
    Store(String),

    #[error("lock service failure: {0}")]
    Lock(String),
}

/// Classification used by the failure-handling work wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Staleness {
    /// The entity vanished concurrently; log and swallow.
    BenignNotFound,
    /// Transition already taken by another worker; log and swallow.
    BenignTerminalTransition,
    /// A real failure; route to the unit's failure handler.
    Real,
}

impl EngineError {
    pub fn staleness(&self) -> Staleness {
        match self {
            EngineError::FlowNodeNotFound(_)
            | EngineError::ProcessInstanceNotFound(_)
            | EngineError::ProcessDefinitionNotFound(_)
            | EngineError::EventNotFound(_) => Staleness::BenignNotFound,
            EngineError::IllegalStateTransition { terminal: true, .. } => {
                Staleness::BenignTerminalTransition
            }
            _ => Staleness::Real,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_benign() {
        let err = EngineError::FlowNodeNotFound(Uuid::now_v7());
        assert_eq!(err.staleness(), Staleness::BenignNotFound);
    }

    #[test]
    fn terminal_transition_is_benign_but_non_terminal_is_real() {
        let node_id = Uuid::now_v7();
        let stale = EngineError::IllegalStateTransition {
            state: StateId::Completed,
            category: StateCategory::Normal,
            node_type: FlowNodeType::AutomaticTask,
            node_id,
            terminal: true,
        };
        assert_eq!(stale.staleness(), Staleness::BenignTerminalTransition);

        let real = EngineError::IllegalStateTransition {
            state: StateId::Aborting,
            category: StateCategory::Normal,
            node_type: FlowNodeType::AutomaticTask,
            node_id,
            terminal: false,
        };
        assert_eq!(real.staleness(), Staleness::Real);
    }

    #[test]
    fn transition_message_names_node_and_category() {
        let err = EngineError::IllegalStateTransition {
            state: StateId::Executing,
            category: StateCategory::Aborting,
            node_type: FlowNodeType::CallActivity,
            node_id: Uuid::nil(),
            terminal: false,
        };
        let msg = err.to_string();
        assert!(msg.contains("Executing"));
        assert!(msg.contains("Aborting"));
        assert!(msg.contains("CallActivity"));
    }
}
