use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events, the durable audit trail for every process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_id: String,
        started_by: Uuid,
    },
    FlowNodeCreated {
        flow_node_id: Uuid,
        definition_id: String,
        node_type: FlowNodeType,
    },
    FlowNodeStateChanged {
        flow_node_id: Uuid,
        from: StateId,
        to: StateId,
        category: StateCategory,
    },
    FlowNodeArchived {
        flow_node_id: Uuid,
        state: StateId,
    },
    CategoryChanged {
        flow_node_id: Uuid,
        category: StateCategory,
    },
    WaitingEventRegistered {
        event_id: Uuid,
        kind: EventKind,
    },
    CoupleMatched {
        waiting_event_id: Uuid,
        thrown_event_id: Uuid,
    },
    CoupleConsumed {
        waiting_event_id: Uuid,
    },
    /// Another worker claimed the waiter first; benign.
    EventClaimLost {
        waiting_event_id: Uuid,
    },
    BoundaryErrorCaught {
        error_code: Option<String>,
        catch_flow_node_id: Uuid,
    },
    ErrorUncaught {
        error_code: Option<String>,
        process_instance_id: Uuid,
    },
    ChildrenAborted {
        process_instance_id: Uuid,
        count: usize,
    },
    OperationApplied {
        operand: String,
        deleted: bool,
    },
    IncidentReported {
        incident_id: Uuid,
    },
    InstanceCompleted {
        instance_id: Uuid,
        at: Timestamp,
    },
    InstanceAborted {
        instance_id: Uuid,
        at: Timestamp,
    },
}
