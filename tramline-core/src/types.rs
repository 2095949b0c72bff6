use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Tenant scope identifier.
pub type TenantId = i64;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Flow node states ─────────────────────────────────────────

/// Which transition table a flow node is currently routed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateCategory {
    Normal,
    Aborting,
    Cancelling,
}

/// The closed set of flow-node lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId {
    Initializing,
    Ready,
    Executing,
    /// Parked awaiting external input (human task, catch event).
    Waiting,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
    /// Execution failed; recoverable by an operator or a boundary route.
    Failed,
}

impl StateId {
    /// Terminal states have no successor in any table.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateId::Completed | StateId::Aborted | StateId::Cancelled)
    }

    /// Stable states are points where execution may safely suspend
    /// awaiting external input.
    pub fn is_stable(&self) -> bool {
        matches!(self, StateId::Waiting | StateId::Failed)
    }

    pub fn is_interrupting(&self) -> bool {
        matches!(self, StateId::Aborting | StateId::Cancelling)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowNodeType {
    AutomaticTask,
    HumanTask,
    CallActivity,
    SubProcess,
    ParallelGateway,
    StartEvent,
    EndEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
}

impl FlowNodeType {
    /// Node kinds that park in the Waiting state until an external
    /// trigger (task completion, event couple) resumes them.
    pub fn waits_for_input(&self) -> bool {
        matches!(
            self,
            FlowNodeType::HumanTask
                | FlowNodeType::IntermediateCatchEvent
                | FlowNodeType::BoundaryEvent
                | FlowNodeType::CallActivity
        )
    }
}

// ─── Flow node instance ───────────────────────────────────────

/// One live execution unit within a process instance. Mutated only by
/// the process executor; archived on terminal transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub id: Uuid,
    /// Reference into the owning process definition.
    pub definition_id: String,
    pub name: String,
    pub node_type: FlowNodeType,
    pub state: StateId,
    pub category: StateCategory,
    pub parent_flow_node_id: Option<Uuid>,
    pub process_instance_id: Uuid,
    pub root_process_instance_id: Uuid,
}

impl FlowNodeInstance {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessInstanceState {
    Initializing,
    Started,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
}

impl ProcessInstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessInstanceState::Completed
                | ProcessInstanceState::Aborted
                | ProcessInstanceState::Cancelled
        )
    }
}

/// Number of label/value slots carried by every process instance.
pub const STRING_INDEX_SLOTS: usize = 5;

/// The top-level execution context of one running process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub name: String,
    pub state: ProcessInstanceState,
    /// Free-form label slots, settable through STRING_INDEX operations.
    pub string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    pub started_by: Uuid,
    /// Identity that acted on behalf of the starter, if any.
    pub started_by_substitute: Option<Uuid>,
    /// Call-activity node that spawned this instance, if any.
    pub caller_flow_node_id: Option<Uuid>,
    pub caller_process_instance_id: Option<Uuid>,
    pub root_process_instance_id: Uuid,
    pub created_at: Timestamp,
}

// ─── Archived records ─────────────────────────────────────────

/// Immutable snapshot written when a flow node reaches a terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedFlowNodeInstance {
    pub source_id: Uuid,
    pub definition_id: String,
    pub name: String,
    pub node_type: FlowNodeType,
    pub state: StateId,
    pub category: StateCategory,
    pub process_instance_id: Uuid,
    pub archived_at: Timestamp,
}

impl ArchivedFlowNodeInstance {
    pub fn of(node: &FlowNodeInstance, at: Timestamp) -> Self {
        Self {
            source_id: node.id,
            definition_id: node.definition_id.clone(),
            name: node.name.clone(),
            node_type: node.node_type,
            state: node.state,
            category: node.category,
            process_instance_id: node.process_instance_id,
            archived_at: at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedProcessInstance {
    pub source_id: Uuid,
    pub definition_id: String,
    pub name: String,
    pub state: ProcessInstanceState,
    pub string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    pub started_by: Uuid,
    pub archived_at: Timestamp,
}

impl ArchivedProcessInstance {
    pub fn of(instance: &ProcessInstance, at: Timestamp) -> Self {
        Self {
            source_id: instance.id,
            definition_id: instance.definition_id.clone(),
            name: instance.name.clone(),
            state: instance.state,
            string_indexes: instance.string_indexes.clone(),
            started_by: instance.started_by,
            archived_at: at,
        }
    }
}

// ─── Correlation events ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Signal,
    Error,
}

/// Persisted record of a catch event awaiting a matching thrown event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitingEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Message/signal name. Unused for error waiters.
    pub name: String,
    /// Error code to catch. `None` catches every code.
    pub error_code: Option<String>,
    /// Definition whose start events this waiter belongs to, and the
    /// target-process key for message matching.
    pub process_definition_id: String,
    /// Catch node definition name, for targeted messages.
    pub flow_node_definition_name: Option<String>,
    /// Owning catch node instance. `None` for process-start waiters.
    pub flow_node_instance_id: Option<Uuid>,
    pub process_instance_id: Option<Uuid>,
    /// For boundary error waiters: the activity node instance whose
    /// (possibly nested) errors this waiter intercepts.
    pub scope_flow_node_id: Option<Uuid>,
    /// A worker currently owns this waiter; excluded from matching.
    pub in_progress: bool,
}

/// A fired message/signal/error awaiting a matching waiter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThrownEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub name: String,
    pub error_code: Option<String>,
    /// Target process definition key (messages only).
    pub target_process: Option<String>,
    /// Target catch node definition name (messages only, optional).
    pub target_flow_node: Option<String>,
    pub correlation_data: BTreeMap<String, Value>,
    pub source_process_instance_id: Option<Uuid>,
}

/// A matched (waiting, thrown) pair ready for joint consumption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventCouple {
    pub waiting: WaitingEvent,
    pub thrown: ThrownEvent,
}

// ─── Operations ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorType {
    /// Replace the target with the right-hand value.
    Assignment,
    /// Mutate one field of the current target object.
    FieldUpdate,
    /// Mutate the value at a JSON-pointer path within the target.
    PathUpdate,
    /// Remove the target.
    Deletion,
}

impl OperatorType {
    /// Operators that mutate an existing value need the current value
    /// pre-retrieved into the evaluation context.
    pub fn requires_current_value(&self) -> bool {
        matches!(self, OperatorType::FieldUpdate | OperatorType::PathUpdate)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeftOperandType {
    Data,
    BusinessData,
    StringIndex,
}

/// The addressable target of a data-mutating operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeftOperand {
    pub name: String,
    pub operand_type: LeftOperandType,
}

/// Reference to a right-hand expression, resolved by the evaluator
/// collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Expression {
    pub content: String,
}

impl Expression {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into() }
    }
}

/// One data-mutating step applied during a transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    pub left: LeftOperand,
    pub operator: OperatorType,
    /// Field name (FieldUpdate) or JSON pointer (PathUpdate).
    pub operator_input: Option<String>,
    /// Right-hand side. `None` only for Deletion.
    pub expression: Option<Expression>,
}

/// What an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    ProcessInstance,
    FlowNodeInstance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: Uuid,
    pub container_type: ContainerType,
}

// ─── Process definitions (collaborator-provided) ──────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventDefinition {
    Message {
        name: String,
        /// Throw events only: definition key of the receiving process.
        target_process: Option<String>,
        /// Throw events only: definition name of the receiving catch node.
        target_flow_node: Option<String>,
    },
    Signal {
        name: String,
    },
    Error {
        code: Option<String>,
    },
}

/// Static description of one flow node. Built by the (out-of-scope)
/// model layer; consumed read-only by the executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub id: String,
    pub name: String,
    pub node_type: FlowNodeType,
    /// Definition ids of successor nodes (all taken by gateways).
    pub outgoing: Vec<String>,
    /// Default flow for tasks; falls back to the first outgoing.
    pub default_outgoing: Option<String>,
    /// Operations run when the node completes.
    pub operations: Vec<Operation>,
    /// Ids of registered connectors run while the node executes.
    pub connectors: Vec<String>,
    /// Catch/throw payload for event nodes.
    pub event: Option<EventDefinition>,
    /// Boundary event definition ids attached to this activity.
    pub attached_boundaries: Vec<String>,
    /// Process definition invoked by a call activity.
    pub target_definition: Option<String>,
}

impl FlowNodeDefinition {
    pub fn new(id: impl Into<String>, node_type: FlowNodeType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type,
            outgoing: Vec::new(),
            default_outgoing: None,
            operations: Vec::new(),
            connectors: Vec::new(),
            event: None,
            attached_boundaries: Vec::new(),
            target_definition: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    /// Definition ids of the default start nodes.
    pub start_nodes: Vec<String>,
    pub nodes: BTreeMap<String, FlowNodeDefinition>,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNodeDefinition> {
        self.nodes.get(id)
    }
}

// ─── Incidents ────────────────────────────────────────────────

/// Operator-facing record of an unrecoverable internal failure,
/// created when failure handling itself fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub description: String,
    pub recovery_procedure: String,
    pub root_cause: String,
    pub handling_failure: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_closed() {
        for state in [StateId::Completed, StateId::Aborted, StateId::Cancelled] {
            assert!(state.is_terminal());
            assert!(!state.is_stable());
        }
        assert!(!StateId::Executing.is_terminal());
        assert!(StateId::Waiting.is_stable());
        assert!(StateId::Failed.is_stable());
    }

    #[test]
    fn archived_flow_node_keeps_identity() {
        let node = FlowNodeInstance {
            id: Uuid::now_v7(),
            definition_id: "task1".into(),
            name: "task1".into(),
            node_type: FlowNodeType::AutomaticTask,
            state: StateId::Completed,
            category: StateCategory::Normal,
            parent_flow_node_id: None,
            process_instance_id: Uuid::now_v7(),
            root_process_instance_id: Uuid::now_v7(),
        };
        let archived = ArchivedFlowNodeInstance::of(&node, 42);
        assert_eq!(archived.source_id, node.id);
        assert_eq!(archived.state, StateId::Completed);
        assert_eq!(archived.archived_at, 42);
    }
}
