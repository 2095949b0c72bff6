use crate::correlation::EventCorrelationEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::RuntimeEvent;
use crate::machine::{FlowNodeStateMachine, StateBehavior, StateRegistry};
use crate::operations::{ExpressionContext, OperationExecutor};
use crate::scheduler::WorkScheduler;
use crate::store::{
    Connector, EngineStore, ExpressionEvaluator, IncidentChannel, LockGuard, LockService,
    ProcessDefinitionService,
};
use crate::types::*;
use crate::work::{FailureHandlingWork, FlowNodeContextWork, MessageContextWork, WorkContext, WorkUnit};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// Which nodes a new instance begins at.
#[derive(Clone, Debug)]
pub enum StartSelector {
    /// The definition's declared start events.
    DefaultStartEvents,
    /// One specific node, for message starts and operator intervention.
    Node(String),
}

pub struct StartRequest {
    pub definition_id: String,
    pub started_by: Uuid,
    pub started_by_substitute: Option<Uuid>,
    /// Data values seeded on the instance before anything runs.
    pub initial_data: BTreeMap<String, Value>,
    /// Operations applied while the instance is still Initializing.
    pub initial_operations: Vec<Operation>,
    /// Connectors run before the instance flips to Started.
    pub pre_start_connectors: Vec<Arc<dyn Connector>>,
    pub caller_flow_node_id: Option<Uuid>,
    pub caller_process_instance_id: Option<Uuid>,
    pub root_process_instance_id: Option<Uuid>,
    pub selector: StartSelector,
}

impl StartRequest {
    pub fn new(definition_id: impl Into<String>, started_by: Uuid) -> Self {
        Self {
            definition_id: definition_id.into(),
            started_by,
            started_by_substitute: None,
            initial_data: BTreeMap::new(),
            initial_operations: Vec::new(),
            pre_start_connectors: Vec::new(),
            caller_flow_node_id: None,
            caller_process_instance_id: None,
            root_process_instance_id: None,
            selector: StartSelector::DefaultStartEvents,
        }
    }
}

/// Drives process instances through their flow nodes.
///
/// All mutation goes through work units on the [`WorkScheduler`], keyed
/// by process instance so concurrent workers never interleave on one
/// instance. The executor itself holds no per-instance state; every
/// work unit reloads what it touches and treats a vanished entity as
/// already handled elsewhere.
pub struct ProcessExecutor {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn ProcessDefinitionService>,
    correlation: EventCorrelationEngine,
    operations: OperationExecutor,
    states: StateRegistry,
    scheduler: Arc<WorkScheduler>,
    locks: Arc<dyn LockService>,
    connectors: HashMap<String, Arc<dyn Connector>>,
    incidents: Arc<dyn IncidentChannel>,
    tenant_id: TenantId,
}

impl ProcessExecutor {
    /// Connectors and custom state behaviors are registered before the
    /// executor is shared; callers wrap the result in an [`Arc`].
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn ProcessDefinitionService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        scheduler: Arc<WorkScheduler>,
        locks: Arc<dyn LockService>,
        incidents: Arc<dyn IncidentChannel>,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            correlation: EventCorrelationEngine::new(store.clone()),
            operations: OperationExecutor::standard(store.clone(), evaluator),
            states: StateRegistry::standard(),
            connectors: HashMap::new(),
            store,
            definitions,
            scheduler,
            locks,
            incidents,
            tenant_id,
        }
    }

    /// Make a connector available to definitions under `id`.
    pub fn register_connector(&mut self, id: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(id.into(), connector);
    }

    /// Swap the lifecycle hooks for one state.
    pub fn register_state(&mut self, behavior: Arc<dyn StateBehavior>) {
        self.states.register(behavior);
    }

    // ── Public surface ──

    pub async fn start(self: &Arc<Self>, request: StartRequest) -> EngineResult<Uuid> {
        let definition = self
            .definitions
            .definition(&request.definition_id)
            .await?
            .ok_or_else(|| EngineError::ProcessDefinitionNotFound(request.definition_id.clone()))?;

        let start_ids: Vec<String> = match &request.selector {
            StartSelector::DefaultStartEvents => definition.start_nodes.clone(),
            StartSelector::Node(id) => vec![id.clone()],
        };
        if start_ids.is_empty() {
            return Err(EngineError::ProcessDefinitionNotFound(format!(
                "definition '{}' declares no start nodes",
                definition.id
            )));
        }
        for id in &start_ids {
            if definition.node(id).is_none() {
                return Err(EngineError::ProcessDefinitionNotFound(format!(
                    "definition '{}' has no node '{id}'",
                    definition.id
                )));
            }
        }

        let id = Uuid::now_v7();
        let instance = ProcessInstance {
            id,
            definition_id: definition.id.clone(),
            name: definition.name.clone(),
            state: ProcessInstanceState::Initializing,
            string_indexes: std::array::from_fn(|_| None),
            started_by: request.started_by,
            started_by_substitute: request.started_by_substitute,
            caller_flow_node_id: request.caller_flow_node_id,
            caller_process_instance_id: request.caller_process_instance_id,
            root_process_instance_id: request.root_process_instance_id.unwrap_or(id),
            created_at: now_ms(),
        };
        self.store.save_process_instance(&instance).await?;
        self.audit(
            id,
            RuntimeEvent::InstanceStarted {
                instance_id: id,
                definition_id: definition.id.clone(),
                started_by: request.started_by,
            },
        )
        .await?;

        let container = ContainerRef {
            id,
            container_type: ContainerType::ProcessInstance,
        };
        let mut context = ExpressionContext::new(container);
        for (name, value) in &request.initial_data {
            self.store.save_data_value(container, name, value.clone()).await?;
            context.seed(name, value.clone());
        }
        if !request.initial_operations.is_empty() {
            self.operations
                .execute(&request.initial_operations, &mut context)
                .await?;
        }
        for connector in &request.pre_start_connectors {
            connector.execute(&mut context).await?;
        }
        self.store
            .update_process_state(id, ProcessInstanceState::Started)
            .await?;

        // String indexes may have changed through initial operations.
        let instance = self
            .store
            .load_process_instance(id)
            .await?
            .ok_or(EngineError::ProcessInstanceNotFound(id))?;
        for start_id in &start_ids {
            let node_def = definition
                .node(start_id)
                .cloned()
                .ok_or_else(|| EngineError::ProcessDefinitionNotFound(start_id.clone()))?;
            self.spawn_node(&definition, &node_def, &instance).await?;
        }
        tracing::info!(instance_id = %id, definition = %definition.id, "process instance started");
        Ok(id)
    }

    /// Externally complete a waiting task, applying its result data.
    pub async fn complete_task(
        self: &Arc<Self>,
        flow_node_id: Uuid,
        operations: &[Operation],
    ) -> EngineResult<()> {
        let node = self
            .store
            .load_flow_node(flow_node_id)
            .await?
            .ok_or(EngineError::FlowNodeNotFound(flow_node_id))?;
        if node.state != StateId::Waiting {
            return Err(EngineError::IllegalStateTransition {
                state: node.state,
                category: node.category,
                node_type: node.node_type,
                node_id: node.id,
                terminal: node.state.is_terminal(),
            });
        }
        if !operations.is_empty() {
            let container = ContainerRef {
                id: node.process_instance_id,
                container_type: ContainerType::ProcessInstance,
            };
            let mut context = ExpressionContext::new(container);
            self.operations.execute(operations, &mut context).await?;
        }
        let updated = self.transition(&node).await?;
        self.submit_node_work(&updated)
    }

    /// Fire a message or signal into correlation and dispatch whatever
    /// it coupled with. Returns the number of couples dispatched.
    pub async fn publish_event(self: &Arc<Self>, thrown: ThrownEvent) -> EngineResult<usize> {
        let couples = self.correlation.fire_event(thrown).await?;
        let count = couples.len();
        self.dispatch_couples(couples).await?;
        Ok(count)
    }

    /// Register a message-start waiter: every matching message starts a
    /// fresh instance of `definition_id`. Also replays messages that
    /// arrived before registration.
    pub async fn register_message_start(
        self: &Arc<Self>,
        definition_id: &str,
        message_name: &str,
    ) -> EngineResult<Uuid> {
        let event = WaitingEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Message,
            name: message_name.to_owned(),
            error_code: None,
            process_definition_id: definition_id.to_owned(),
            flow_node_definition_name: None,
            flow_node_instance_id: None,
            process_instance_id: None,
            scope_flow_node_id: None,
            in_progress: false,
        };
        let id = event.id;
        self.correlation.register_waiting_event(event).await?;
        let deferred = self.correlation.deferred_couples().await?;
        self.dispatch_couples(deferred).await?;
        Ok(id)
    }

    pub async fn abort(self: &Arc<Self>, instance_id: Uuid) -> EngineResult<()> {
        self.interrupt_instance(instance_id, StateCategory::Aborting)
            .await
            .map(|_| ())
    }

    pub async fn cancel(self: &Arc<Self>, instance_id: Uuid) -> EngineResult<()> {
        self.interrupt_instance(instance_id, StateCategory::Cancelling)
            .await
            .map(|_| ())
    }

    // ── Flow node advancement ──

    async fn advance_flow_node(self: &Arc<Self>, flow_node_id: Uuid) -> EngineResult<()> {
        loop {
            // Reload every iteration: another worker may have changed
            // the category or removed the node.
            let node = self
                .store
                .load_flow_node(flow_node_id)
                .await?
                .ok_or(EngineError::FlowNodeNotFound(flow_node_id))?;

            if node.category != StateCategory::Normal {
                self.advance_interrupted(node).await?;
                return Ok(());
            }

            match node.state {
                StateId::Initializing => {
                    let behavior = self.states.behavior(StateId::Initializing);
                    behavior.before_on_enter(&node).await?;
                    behavior.on_enter_to_on_finish(&node).await?;
                    self.transition(&node).await?;
                    behavior.after_on_finish(&node).await?;
                }
                StateId::Ready => {
                    let behavior = self.states.behavior(StateId::Ready);
                    behavior.before_on_enter(&node).await?;
                    behavior.on_enter_to_on_finish(&node).await?;
                    if node.node_type.waits_for_input() {
                        self.park(&node).await?;
                        behavior.after_on_finish(&node).await?;
                        return Ok(());
                    }
                    self.transition(&node).await?;
                    behavior.after_on_finish(&node).await?;
                }
                StateId::Executing => {
                    let behavior = self.states.behavior(StateId::Executing);
                    behavior.before_on_enter(&node).await?;
                    self.run_node_connectors(&node).await?;
                    behavior.on_enter_to_on_finish(&node).await?;
                    let unwinding = self.run_throw_events(&node).await?;
                    behavior.after_on_finish(&node).await?;
                    if unwinding {
                        // An error end event dismantles its own subtree.
                        return Ok(());
                    }
                    self.transition(&node).await?;
                }
                StateId::Completing => {
                    let behavior = self.states.behavior(StateId::Completing);
                    behavior.before_on_enter(&node).await?;
                    behavior.on_enter_to_on_finish(&node).await?;
                    self.run_completion_operations(&node).await?;
                    let updated = self.transition(&node).await?;
                    behavior.after_on_finish(&node).await?;
                    if updated.state.is_terminal() {
                        self.finalize_completed(&updated).await?;
                        return Ok(());
                    }
                }
                StateId::Waiting | StateId::Failed => return Ok(()),
                _ => {
                    // Terminal or interrupting state under Normal
                    // category: a stale wakeup, nothing left to do.
                    return Ok(());
                }
            }
        }
    }

    async fn advance_interrupted(self: &Arc<Self>, mut node: FlowNodeInstance) -> EngineResult<()> {
        while !node.state.is_terminal() {
            node = self.transition(&node).await?;
        }
        self.archive_node(&node).await
    }

    async fn transition(&self, node: &FlowNodeInstance) -> EngineResult<FlowNodeInstance> {
        let next = FlowNodeStateMachine::next_state(node)?;
        self.store.update_flow_node_state(node.id, next).await?;
        self.audit(
            node.process_instance_id,
            RuntimeEvent::FlowNodeStateChanged {
                flow_node_id: node.id,
                from: node.state,
                to: next,
                category: node.category,
            },
        )
        .await?;
        let mut updated = node.clone();
        updated.state = next;
        Ok(updated)
    }

    /// Suspend a node in the Waiting state; for call activities this
    /// also starts the child instance, for catch events it registers
    /// the waiter.
    async fn park(self: &Arc<Self>, node: &FlowNodeInstance) -> EngineResult<()> {
        let (instance, _definition, node_def) = self.node_context(node).await?;
        match node.node_type {
            FlowNodeType::CallActivity => {
                let target = node_def.target_definition.clone().ok_or_else(|| {
                    EngineError::ProcessDefinitionNotFound(format!(
                        "call activity '{}' names no target definition",
                        node_def.id
                    ))
                })?;
                // Park before starting: a fast child must find the
                // caller already Waiting when it completes.
                self.park_node(node).await?;
                let mut request = StartRequest::new(&target, instance.started_by);
                request.started_by_substitute = instance.started_by_substitute;
                request.caller_flow_node_id = Some(node.id);
                request.caller_process_instance_id = Some(instance.id);
                request.root_process_instance_id = Some(instance.root_process_instance_id);
                self.start(request).await?;
                Ok(())
            }
            FlowNodeType::IntermediateCatchEvent | FlowNodeType::BoundaryEvent => {
                if let Some(waiter) = Self::waiter_for_catch(&instance, &node_def, node) {
                    self.correlation.register_waiting_event(waiter).await?;
                }
                self.park_node(node).await
            }
            _ => self.park_node(node).await,
        }
    }

    async fn park_node(&self, node: &FlowNodeInstance) -> EngineResult<()> {
        self.store
            .update_flow_node_state(node.id, StateId::Waiting)
            .await?;
        self.audit(
            node.process_instance_id,
            RuntimeEvent::FlowNodeStateChanged {
                flow_node_id: node.id,
                from: node.state,
                to: StateId::Waiting,
                category: node.category,
            },
        )
        .await
    }

    fn waiter_for_catch(
        instance: &ProcessInstance,
        node_def: &FlowNodeDefinition,
        node: &FlowNodeInstance,
    ) -> Option<WaitingEvent> {
        let base = WaitingEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Message,
            name: String::new(),
            error_code: None,
            process_definition_id: instance.definition_id.clone(),
            flow_node_definition_name: Some(node_def.name.clone()),
            flow_node_instance_id: Some(node.id),
            process_instance_id: Some(instance.id),
            scope_flow_node_id: None,
            in_progress: false,
        };
        match node_def.event.as_ref()? {
            EventDefinition::Message { name, .. } => Some(WaitingEvent {
                name: name.clone(),
                ..base
            }),
            EventDefinition::Signal { name } => Some(WaitingEvent {
                kind: EventKind::Signal,
                name: name.clone(),
                ..base
            }),
            EventDefinition::Error { code } => Some(WaitingEvent {
                kind: EventKind::Error,
                error_code: code.clone(),
                scope_flow_node_id: node.parent_flow_node_id,
                ..base
            }),
        }
    }

    /// Throw whatever event the node's definition declares. Returns
    /// true when an error was thrown and the subtree is unwinding.
    async fn run_throw_events(self: &Arc<Self>, node: &FlowNodeInstance) -> EngineResult<bool> {
        if !matches!(
            node.node_type,
            FlowNodeType::EndEvent | FlowNodeType::IntermediateThrowEvent
        ) {
            return Ok(false);
        }
        let (instance, _definition, node_def) = self.node_context(node).await?;
        let Some(event) = node_def.event.clone() else {
            return Ok(false);
        };
        match event {
            EventDefinition::Error { code } => {
                self.throw_error(node, &instance, code).await?;
                Ok(true)
            }
            EventDefinition::Message {
                name,
                target_process,
                target_flow_node,
            } => {
                let thrown = ThrownEvent {
                    id: Uuid::now_v7(),
                    kind: EventKind::Message,
                    name,
                    error_code: None,
                    target_process,
                    target_flow_node,
                    correlation_data: BTreeMap::new(),
                    source_process_instance_id: Some(node.process_instance_id),
                };
                let couples = self.correlation.fire_event(thrown).await?;
                self.dispatch_couples(couples).await?;
                Ok(false)
            }
            EventDefinition::Signal { name } => {
                let thrown = ThrownEvent {
                    id: Uuid::now_v7(),
                    kind: EventKind::Signal,
                    name,
                    error_code: None,
                    target_process: None,
                    target_flow_node: None,
                    correlation_data: BTreeMap::new(),
                    source_process_instance_id: Some(node.process_instance_id),
                };
                let couples = self.correlation.fire_event(thrown).await?;
                self.dispatch_couples(couples).await?;
                Ok(false)
            }
        }
    }

    /// Run the connectors a node's definition names, in list order.
    /// A failure propagates and takes the node's failure route.
    async fn run_node_connectors(&self, node: &FlowNodeInstance) -> EngineResult<()> {
        let (_instance, _definition, node_def) = self.node_context(node).await?;
        if node_def.connectors.is_empty() {
            return Ok(());
        }
        let container = ContainerRef {
            id: node.process_instance_id,
            container_type: ContainerType::ProcessInstance,
        };
        let mut context = ExpressionContext::new(container);
        for id in &node_def.connectors {
            let connector = self
                .connectors
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::ConnectorNotFound(id.clone()))?;
            connector.execute(&mut context).await?;
            tracing::debug!(connector = %id, flow_node = %node.id, "connector executed");
        }
        Ok(())
    }

    /// Lock a process instance other than the one the running work unit
    /// is keyed on. Foreign locks are only ever taken in the caller or
    /// ancestor direction, which keeps the acquisition order acyclic.
    async fn lock_foreign_instance(
        &self,
        target: Option<Uuid>,
        held: Uuid,
    ) -> EngineResult<Option<LockGuard>> {
        match target {
            Some(id) if id != held => self.locks.acquire(id).await.map(Some),
            _ => Ok(None),
        }
    }

    // ── Error propagation ──

    async fn throw_error(
        self: &Arc<Self>,
        node: &FlowNodeInstance,
        instance: &ProcessInstance,
        code: Option<String>,
    ) -> EngineResult<()> {
        match self
            .correlation
            .boundary_handler_for(node, code.as_deref())
            .await?
        {
            Some(waiter) => self.catch_error(waiter, code, node).await,
            None => {
                self.audit(
                    node.process_instance_id,
                    RuntimeEvent::ErrorUncaught {
                        error_code: code.clone(),
                        process_instance_id: node.process_instance_id,
                    },
                )
                .await?;
                tracing::warn!(
                    instance_id = %instance.id,
                    error_code = ?code,
                    "uncaught error; aborting instance"
                );
                let caller = instance.caller_flow_node_id;
                self.interrupt_instance(node.process_instance_id, StateCategory::Aborting)
                    .await?;
                // An uncaught child error does not fail the caller.
                if let Some(caller) = caller {
                    let _guard = self
                        .lock_foreign_instance(
                            instance.caller_process_instance_id,
                            node.process_instance_id,
                        )
                        .await?;
                    self.resume_node(caller).await?;
                }
                Ok(())
            }
        }
    }

    async fn catch_error(
        self: &Arc<Self>,
        waiter: WaitingEvent,
        code: Option<String>,
        thrown_from: &FlowNodeInstance,
    ) -> EngineResult<()> {
        match self.correlation.claim(waiter.id).await {
            Ok(true) => {}
            Ok(false) => {
                self.audit(
                    thrown_from.process_instance_id,
                    RuntimeEvent::EventClaimLost {
                        waiting_event_id: waiter.id,
                    },
                )
                .await?;
                return Ok(());
            }
            Err(EngineError::EventNotFound(_)) => return Ok(()),
            Err(error) => return Err(error),
        }

        // The catching node usually lives in an ancestor instance; its
        // lock serializes the teardown against work running there.
        let _guard = self
            .lock_foreign_instance(waiter.process_instance_id, thrown_from.process_instance_id)
            .await?;

        self.audit(
            waiter
                .process_instance_id
                .unwrap_or(thrown_from.process_instance_id),
            RuntimeEvent::BoundaryErrorCaught {
                error_code: code.clone(),
                catch_flow_node_id: waiter.flow_node_instance_id.unwrap_or(Uuid::nil()),
            },
        )
        .await?;

        if let Some(scope_id) = waiter.scope_flow_node_id {
            self.abort_scope(scope_id, waiter.flow_node_instance_id).await?;
        }

        let thrown = ThrownEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Error,
            name: code.clone().unwrap_or_default(),
            error_code: code,
            target_process: None,
            target_flow_node: None,
            correlation_data: BTreeMap::new(),
            source_process_instance_id: Some(thrown_from.process_instance_id),
        };
        let couple = EventCouple {
            waiting: waiter.clone(),
            thrown,
        };
        self.correlation.consume(&couple).await?;
        if let Some(catch_node) = waiter.flow_node_instance_id {
            self.resume_node(catch_node).await?;
        }
        Ok(())
    }

    /// Dismantle everything below the caught scope: the child instance
    /// the scope activity spawned, the activity itself, and its other
    /// boundary nodes.
    async fn abort_scope(
        self: &Arc<Self>,
        scope_node_id: Uuid,
        keep_node_id: Option<Uuid>,
    ) -> EngineResult<()> {
        if let Some(child) = self.store.find_child_instance(scope_node_id).await? {
            self.interrupt_instance(child.id, StateCategory::Aborting)
                .await?;
        }
        if let Some(scope_node) = self.store.load_flow_node(scope_node_id).await? {
            let siblings = self
                .store
                .load_flow_nodes(scope_node.process_instance_id)
                .await?;
            for sibling in siblings {
                if sibling.parent_flow_node_id == Some(scope_node_id)
                    && Some(sibling.id) != keep_node_id
                {
                    self.interrupt_node(sibling, StateCategory::Aborting).await?;
                }
            }
            self.interrupt_node(scope_node, StateCategory::Aborting)
                .await?;
        }
        Ok(())
    }

    async fn interrupt_node(
        self: &Arc<Self>,
        mut node: FlowNodeInstance,
        category: StateCategory,
    ) -> EngineResult<()> {
        // Waiters die with the node, or a later event would couple with
        // a catch that no longer exists and be lost.
        self.correlation.withdraw_node_waiters(node.id).await?;
        self.store
            .update_flow_node_category(node.id, category)
            .await?;
        self.audit(
            node.process_instance_id,
            RuntimeEvent::CategoryChanged {
                flow_node_id: node.id,
                category,
            },
        )
        .await?;
        node.category = category;
        self.advance_interrupted(node).await
    }

    /// Abort or cancel an instance and, recursively, the child
    /// instances of its call activities. Runs inline: the instance is
    /// drained before this returns.
    fn interrupt_instance<'a>(
        self: &'a Arc<Self>,
        instance_id: Uuid,
        category: StateCategory,
    ) -> Pin<Box<dyn Future<Output = EngineResult<usize>> + Send + 'a>> {
        Box::pin(async move {
            let Some(instance) = self.store.load_process_instance(instance_id).await? else {
                return Ok(0);
            };
            let (pending, terminal) = match category {
                StateCategory::Aborting => {
                    (ProcessInstanceState::Aborting, ProcessInstanceState::Aborted)
                }
                StateCategory::Cancelling => (
                    ProcessInstanceState::Cancelling,
                    ProcessInstanceState::Cancelled,
                ),
                StateCategory::Normal => {
                    return Err(EngineError::Store(
                        "instances are not interrupted through the normal category".into(),
                    ))
                }
            };
            self.store.update_process_state(instance_id, pending).await?;

            let nodes = self.store.load_flow_nodes(instance_id).await?;
            let mut count = 0;
            for node in nodes {
                if node.node_type == FlowNodeType::CallActivity {
                    if let Some(child) = self.store.find_child_instance(node.id).await? {
                        count += self.interrupt_instance(child.id, category).await?;
                    }
                }
                self.interrupt_node(node, category).await?;
                count += 1;
            }
            self.correlation
                .withdraw_instance_waiters(instance_id)
                .await?;
            self.audit(
                instance_id,
                RuntimeEvent::ChildrenAborted {
                    process_instance_id: instance_id,
                    count,
                },
            )
            .await?;

            let record = ArchivedProcessInstance::of(
                &ProcessInstance {
                    state: terminal,
                    ..instance
                },
                now_ms(),
            );
            self.store.archive_process_instance(&record).await?;
            self.store.delete_process_instance(instance_id).await?;
            if category == StateCategory::Aborting {
                self.audit(
                    instance_id,
                    RuntimeEvent::InstanceAborted {
                        instance_id,
                        at: record.archived_at,
                    },
                )
                .await?;
            }
            tracing::info!(%instance_id, state = ?terminal, "process instance interrupted");
            Ok(count)
        })
    }

    // ── Completion ──

    async fn run_completion_operations(&self, node: &FlowNodeInstance) -> EngineResult<()> {
        let (_instance, _definition, node_def) = self.node_context(node).await?;
        if node_def.operations.is_empty() {
            return Ok(());
        }
        let container = ContainerRef {
            id: node.process_instance_id,
            container_type: ContainerType::ProcessInstance,
        };
        let mut context = ExpressionContext::new(container);
        self.operations
            .execute(&node_def.operations, &mut context)
            .await?;
        for op in &node_def.operations {
            self.audit(
                node.process_instance_id,
                RuntimeEvent::OperationApplied {
                    operand: op.left.name.clone(),
                    deleted: op.operator == OperatorType::Deletion,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn finalize_completed(self: &Arc<Self>, node: &FlowNodeInstance) -> EngineResult<()> {
        self.archive_node(node).await?;

        // A normally completed activity retires its untriggered
        // boundary events, waiters included.
        let siblings = self.store.load_flow_nodes(node.process_instance_id).await?;
        for sibling in siblings {
            if sibling.parent_flow_node_id == Some(node.id) {
                self.interrupt_node(sibling, StateCategory::Aborting).await?;
            }
        }

        let (instance, definition, node_def) = self.node_context(node).await?;

        // Gateways activate every outgoing flow; everything else takes
        // its default flow.
        let successors: Vec<String> = if node.node_type == FlowNodeType::ParallelGateway {
            node_def.outgoing.clone()
        } else if let Some(default) = node_def.default_outgoing.clone() {
            vec![default]
        } else {
            node_def.outgoing.first().cloned().into_iter().collect()
        };

        if successors.is_empty() {
            return self.try_complete_instance(instance.id).await;
        }
        for successor_id in successors {
            let successor = definition
                .node(&successor_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::ProcessDefinitionNotFound(format!(
                        "definition '{}' has no node '{successor_id}'",
                        definition.id
                    ))
                })?;
            self.spawn_node(&definition, &successor, &instance).await?;
        }
        Ok(())
    }

    async fn try_complete_instance(self: &Arc<Self>, instance_id: Uuid) -> EngineResult<()> {
        let Some(instance) = self.store.load_process_instance(instance_id).await? else {
            return Ok(());
        };
        if !self.store.load_flow_nodes(instance_id).await?.is_empty() {
            return Ok(());
        }
        self.store
            .update_process_state(instance_id, ProcessInstanceState::Completed)
            .await?;
        let record = ArchivedProcessInstance::of(
            &ProcessInstance {
                state: ProcessInstanceState::Completed,
                ..instance.clone()
            },
            now_ms(),
        );
        self.store.archive_process_instance(&record).await?;
        self.store.delete_process_instance(instance_id).await?;
        self.audit(
            instance_id,
            RuntimeEvent::InstanceCompleted {
                instance_id,
                at: record.archived_at,
            },
        )
        .await?;
        tracing::info!(%instance_id, "process instance completed");

        let deferred = self.correlation.deferred_couples().await?;
        self.dispatch_couples(deferred).await?;
        if let Some(caller) = instance.caller_flow_node_id {
            let _guard = self
                .lock_foreign_instance(instance.caller_process_instance_id, instance.id)
                .await?;
            self.resume_node(caller).await?;
        }
        Ok(())
    }

    async fn archive_node(&self, node: &FlowNodeInstance) -> EngineResult<()> {
        self.store
            .archive_flow_node(&ArchivedFlowNodeInstance::of(node, now_ms()))
            .await?;
        self.store.delete_flow_node(node.id).await?;
        self.audit(
            node.process_instance_id,
            RuntimeEvent::FlowNodeArchived {
                flow_node_id: node.id,
                state: node.state,
            },
        )
        .await
    }

    // ── Node creation and dispatch ──

    async fn spawn_node(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        node_def: &FlowNodeDefinition,
        instance: &ProcessInstance,
    ) -> EngineResult<()> {
        let node = self
            .create_node(node_def, instance, None, StateId::Initializing)
            .await?;
        // Boundary waiters must exist before the activity (and anything
        // it calls) can run, or an early throw escapes them.
        for boundary_id in &node_def.attached_boundaries {
            let boundary_def = definition.node(boundary_id).ok_or_else(|| {
                EngineError::ProcessDefinitionNotFound(format!(
                    "definition '{}' has no boundary node '{boundary_id}'",
                    definition.id
                ))
            })?;
            let boundary = self
                .create_node(boundary_def, instance, Some(node.id), StateId::Waiting)
                .await?;
            if let Some(waiter) = Self::waiter_for_catch(instance, boundary_def, &boundary) {
                self.correlation.register_waiting_event(waiter).await?;
            }
        }
        self.submit_node_work(&node)
    }

    async fn create_node(
        &self,
        node_def: &FlowNodeDefinition,
        instance: &ProcessInstance,
        parent: Option<Uuid>,
        state: StateId,
    ) -> EngineResult<FlowNodeInstance> {
        let node = FlowNodeInstance {
            id: Uuid::now_v7(),
            definition_id: node_def.id.clone(),
            name: node_def.name.clone(),
            node_type: node_def.node_type,
            state,
            category: StateCategory::Normal,
            parent_flow_node_id: parent,
            process_instance_id: instance.id,
            root_process_instance_id: instance.root_process_instance_id,
        };
        self.store.save_flow_node(&node).await?;
        self.audit(
            instance.id,
            RuntimeEvent::FlowNodeCreated {
                flow_node_id: node.id,
                definition_id: node.definition_id.clone(),
                node_type: node.node_type,
            },
        )
        .await?;
        Ok(node)
    }

    fn submit_node_work(self: &Arc<Self>, node: &FlowNodeInstance) -> EngineResult<()> {
        let unit = FailureHandlingWork {
            tenant_id: self.tenant_id,
            store: self.store.clone(),
            incidents: self.incidents.clone(),
            inner: Box::new(FlowNodeContextWork {
                flow_node_instance_id: node.id,
                process_instance_id: node.process_instance_id,
                inner: Box::new(ExecuteFlowNodeWork {
                    executor: self.clone(),
                    flow_node_id: node.id,
                    process_instance_id: node.process_instance_id,
                }),
            }),
        };
        self.scheduler.submit(Box::new(unit))
    }

    async fn dispatch_couples(self: &Arc<Self>, couples: Vec<EventCouple>) -> EngineResult<()> {
        for couple in couples {
            match self.correlation.claim(couple.waiting.id).await {
                Ok(true) => {
                    let waiting_event_id = couple.waiting.id;
                    let unit = FailureHandlingWork {
                        tenant_id: self.tenant_id,
                        store: self.store.clone(),
                        incidents: self.incidents.clone(),
                        inner: Box::new(MessageContextWork {
                            thrown_event_id: couple.thrown.id,
                            inner: Box::new(ExecuteCoupleWork {
                                executor: self.clone(),
                                couple,
                            }),
                        }),
                    };
                    if let Err(error) = self.scheduler.submit(Box::new(unit)) {
                        // The claim must not outlive a failed hand-off.
                        self.correlation.release(waiting_event_id).await?;
                        return Err(error);
                    }
                }
                Ok(false) | Err(EngineError::EventNotFound(_)) => {
                    if let Some(instance_id) = couple.waiting.process_instance_id {
                        self.audit(
                            instance_id,
                            RuntimeEvent::EventClaimLost {
                                waiting_event_id: couple.waiting.id,
                            },
                        )
                        .await?;
                    }
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Deliver one claimed couple: wake the waiting catch node, or
    /// start a fresh instance for a process-start waiter.
    async fn deliver_couple(self: &Arc<Self>, couple: &EventCouple) -> EngineResult<()> {
        match couple.waiting.flow_node_instance_id {
            Some(node_id) => {
                if let Some(instance_id) = couple.waiting.process_instance_id {
                    let container = ContainerRef {
                        id: instance_id,
                        container_type: ContainerType::ProcessInstance,
                    };
                    for (name, value) in &couple.thrown.correlation_data {
                        self.store
                            .save_data_value(container, name, value.clone())
                            .await?;
                    }
                }
                self.correlation.consume(couple).await?;
                self.resume_node(node_id).await
            }
            None => {
                let mut request = StartRequest::new(
                    &couple.waiting.process_definition_id,
                    couple.thrown.source_process_instance_id.unwrap_or(Uuid::nil()),
                );
                request.initial_data = couple.thrown.correlation_data.clone();
                let started = self.start(request).await;
                // Start waiters outlive each delivery.
                self.correlation.release(couple.waiting.id).await?;
                started.map(|_| ())
            }
        }
    }

    async fn resume_node(self: &Arc<Self>, flow_node_id: Uuid) -> EngineResult<()> {
        let Some(node) = self.store.load_flow_node(flow_node_id).await? else {
            tracing::debug!(%flow_node_id, "resume target gone");
            return Ok(());
        };
        if node.state != StateId::Waiting {
            tracing::debug!(%flow_node_id, state = ?node.state, "resume target not waiting");
            return Ok(());
        }
        let updated = self.transition(&node).await?;
        self.submit_node_work(&updated)
    }

    async fn release_waiter(&self, waiting_event_id: Uuid) -> EngineResult<()> {
        self.correlation.release(waiting_event_id).await
    }

    /// Recovery path of a failed flow-node work unit: route to a
    /// catch-all boundary if one is in scope, otherwise leave the node
    /// in the Failed state for operator intervention.
    async fn handle_node_failure(
        self: &Arc<Self>,
        flow_node_id: Uuid,
        _error: &EngineError,
    ) -> EngineResult<()> {
        let Some(node) = self.store.load_flow_node(flow_node_id).await? else {
            return Ok(());
        };
        match self.correlation.boundary_handler_for(&node, None).await? {
            Some(waiter) => self.catch_error(waiter, None, &node).await,
            None => {
                self.store
                    .update_flow_node_state(node.id, StateId::Failed)
                    .await?;
                self.audit(
                    node.process_instance_id,
                    RuntimeEvent::FlowNodeStateChanged {
                        flow_node_id: node.id,
                        from: node.state,
                        to: StateId::Failed,
                        category: node.category,
                    },
                )
                .await
            }
        }
    }

    async fn node_context(
        &self,
        node: &FlowNodeInstance,
    ) -> EngineResult<(ProcessInstance, ProcessDefinition, FlowNodeDefinition)> {
        let instance = self
            .store
            .load_process_instance(node.process_instance_id)
            .await?
            .ok_or(EngineError::ProcessInstanceNotFound(node.process_instance_id))?;
        let definition = self
            .definitions
            .definition(&instance.definition_id)
            .await?
            .ok_or_else(|| EngineError::ProcessDefinitionNotFound(instance.definition_id.clone()))?;
        let node_def = definition.node(&node.definition_id).cloned().ok_or_else(|| {
            EngineError::ProcessDefinitionNotFound(format!(
                "definition '{}' has no node '{}'",
                definition.id, node.definition_id
            ))
        })?;
        Ok((instance, definition, node_def))
    }

    async fn audit(&self, instance_id: Uuid, event: RuntimeEvent) -> EngineResult<()> {
        self.store.append_event(instance_id, &event).await.map(|_| ())
    }
}

struct ExecuteFlowNodeWork {
    executor: Arc<ProcessExecutor>,
    flow_node_id: Uuid,
    process_instance_id: Uuid,
}

#[async_trait]
impl WorkUnit for ExecuteFlowNodeWork {
    fn description(&self) -> String {
        "advance flow node".into()
    }

    fn lock_key(&self) -> Option<Uuid> {
        Some(self.process_instance_id)
    }

    async fn work(&self, _context: &mut WorkContext) -> EngineResult<()> {
        self.executor.advance_flow_node(self.flow_node_id).await
    }

    async fn handle_failure(
        &self,
        error: &EngineError,
        _context: &mut WorkContext,
    ) -> EngineResult<()> {
        self.executor
            .handle_node_failure(self.flow_node_id, error)
            .await
    }
}

struct ExecuteCoupleWork {
    executor: Arc<ProcessExecutor>,
    couple: EventCouple,
}

#[async_trait]
impl WorkUnit for ExecuteCoupleWork {
    fn description(&self) -> String {
        format!("deliver event couple '{}'", self.couple.thrown.name)
    }

    fn lock_key(&self) -> Option<Uuid> {
        self.couple.waiting.process_instance_id
    }

    async fn work(&self, _context: &mut WorkContext) -> EngineResult<()> {
        self.executor.deliver_couple(&self.couple).await
    }

    async fn handle_failure(
        &self,
        error: &EngineError,
        _context: &mut WorkContext,
    ) -> EngineResult<()> {
        tracing::warn!(%error, "couple delivery failed; releasing waiter");
        self.executor.release_waiter(self.couple.waiting.id).await
    }
}
