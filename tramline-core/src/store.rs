use crate::error::EngineResult;
use crate::events::RuntimeEvent;
use crate::operations::ExpressionContext;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use uuid::Uuid;

/// Persistence contract for all engine state.
///
/// The executor, correlation engine, and operation handlers operate
/// exclusively through this trait, keeping the storage engine a pluggable
/// collaborator (in-memory for tests and single-node, a database for
/// production).
#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Process instances ──

    async fn save_process_instance(&self, instance: &ProcessInstance) -> EngineResult<()>;
    async fn load_process_instance(&self, id: Uuid) -> EngineResult<Option<ProcessInstance>>;
    async fn update_process_state(&self, id: Uuid, state: ProcessInstanceState)
        -> EngineResult<()>;
    async fn set_string_index(&self, id: Uuid, slot: usize, value: Option<String>)
        -> EngineResult<()>;
    async fn delete_process_instance(&self, id: Uuid) -> EngineResult<()>;
    /// The child instance spawned by a call-activity node, if still live.
    async fn find_child_instance(&self, caller_flow_node_id: Uuid)
        -> EngineResult<Option<ProcessInstance>>;

    // ── Flow node instances ──

    async fn save_flow_node(&self, node: &FlowNodeInstance) -> EngineResult<()>;
    async fn load_flow_node(&self, id: Uuid) -> EngineResult<Option<FlowNodeInstance>>;
    async fn load_flow_nodes(&self, process_instance_id: Uuid)
        -> EngineResult<Vec<FlowNodeInstance>>;
    async fn update_flow_node_state(&self, id: Uuid, state: StateId) -> EngineResult<()>;
    async fn update_flow_node_category(&self, id: Uuid, category: StateCategory)
        -> EngineResult<()>;
    async fn delete_flow_node(&self, id: Uuid) -> EngineResult<()>;

    // ── Data values (left-operand backing) ──

    async fn load_data_value(&self, container: ContainerRef, name: &str)
        -> EngineResult<Option<Value>>;
    async fn save_data_value(&self, container: ContainerRef, name: &str, value: Value)
        -> EngineResult<()>;
    async fn delete_data_value(&self, container: ContainerRef, name: &str) -> EngineResult<()>;

    // ── Waiting events ──

    async fn save_waiting_event(&self, event: &WaitingEvent) -> EngineResult<()>;
    async fn load_waiting_event(&self, id: Uuid) -> EngineResult<Option<WaitingEvent>>;
    /// Matchable waiters of one kind. Waiters marked in-progress are
    /// excluded; they are owned by a worker already.
    async fn list_waiting_events(&self, kind: EventKind) -> EngineResult<Vec<WaitingEvent>>;
    /// Atomically mark a waiter in-progress. Returns false when another
    /// worker already holds it; errors with EventNotFound when consumed.
    async fn claim_waiting_event(&self, id: Uuid) -> EngineResult<bool>;
    /// Crash recovery: put a claimed waiter back into matching.
    async fn release_waiting_event(&self, id: Uuid) -> EngineResult<()>;
    async fn delete_waiting_event(&self, id: Uuid) -> EngineResult<()>;
    /// Remove every waiter one flow node instance registered. Claimed
    /// waiters are removed too; the node they would wake is gone.
    async fn delete_waiting_events_for_node(&self, flow_node_instance_id: Uuid)
        -> EngineResult<()>;
    /// Remove every waiter scoped to one process instance. Start
    /// waiters carry no instance and are untouched.
    async fn delete_waiting_events_for_instance(&self, process_instance_id: Uuid)
        -> EngineResult<()>;

    // ── Deferred thrown events ──

    /// Thrown events that found no waiter, kept for deferred delivery.
    async fn save_pending_thrown(&self, event: &ThrownEvent) -> EngineResult<()>;
    async fn list_pending_thrown(&self) -> EngineResult<Vec<ThrownEvent>>;
    async fn delete_pending_thrown(&self, id: Uuid) -> EngineResult<()>;

    // ── Archive (append-only) ──

    async fn archive_flow_node(&self, record: &ArchivedFlowNodeInstance) -> EngineResult<()>;
    async fn archive_process_instance(&self, record: &ArchivedProcessInstance)
        -> EngineResult<()>;
    async fn load_archived_flow_node(&self, source_id: Uuid)
        -> EngineResult<Option<ArchivedFlowNodeInstance>>;
    async fn load_archived_process_instance(&self, source_id: Uuid)
        -> EngineResult<Option<ArchivedProcessInstance>>;

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> EngineResult<()>;
    async fn load_incidents(&self, tenant_id: TenantId) -> EngineResult<Vec<Incident>>;

    // ── Audit log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> EngineResult<u64>;
    async fn read_events(&self, instance_id: Uuid, from_seq: u64)
        -> EngineResult<Vec<(u64, RuntimeEvent)>>;
}

/// Resolves process definitions. The model layer building these is out
/// of scope; the executor only reads them.
#[async_trait]
pub trait ProcessDefinitionService: Send + Sync {
    async fn definition(&self, id: &str) -> EngineResult<Option<ProcessDefinition>>;
}

/// Evaluates right-hand expressions against an operation context.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &Expression, context: &ExpressionContext)
        -> EngineResult<Value>;
}

/// Fire-and-forget operator notification channel. Must not fail: the
/// incident report is the last line of defense.
#[async_trait]
pub trait IncidentChannel: Send + Sync {
    async fn report(&self, tenant_id: TenantId, incident: &Incident);
}

/// Held for the duration of a keyed critical section; releasing is
/// dropping.
pub struct LockGuard {
    _token: Box<dyn Any + Send>,
}

impl LockGuard {
    pub fn new(token: Box<dyn Any + Send>) -> Self {
        Self { _token: token }
    }
}

/// Named, process-instance-scoped mutual exclusion, the only
/// synchronization primitive assumed available across a cluster.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, key: Uuid) -> EngineResult<LockGuard>;
}

/// Connector executed at a state boundary (before process start, around
/// task execution). Implementations live outside the core.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn execute(&self, context: &mut ExpressionContext) -> EngineResult<()>;
}
