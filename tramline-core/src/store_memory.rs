use crate::error::{EngineError, EngineResult};
use crate::events::RuntimeEvent;
use crate::operations::ExpressionContext;
use crate::store::*;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// In-memory store: backs tests and single-node deployments. Every
/// method locks the whole state; no await happens under the lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, ProcessInstance>,
    flow_nodes: HashMap<Uuid, FlowNodeInstance>,
    data: HashMap<(Uuid, String), Value>,
    waiting: HashMap<Uuid, WaitingEvent>,
    pending_thrown: Vec<ThrownEvent>,
    archived_nodes: HashMap<Uuid, ArchivedFlowNodeInstance>,
    archived_instances: HashMap<Uuid, ArchivedProcessInstance>,
    incidents: Vec<Incident>,
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn save_process_instance(&self, instance: &ProcessInstance) -> EngineResult<()> {
        self.lock().instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_process_instance(&self, id: Uuid) -> EngineResult<Option<ProcessInstance>> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn update_process_state(
        &self,
        id: Uuid,
        state: ProcessInstanceState,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(EngineError::ProcessInstanceNotFound(id))?;
        instance.state = state;
        Ok(())
    }

    async fn set_string_index(
        &self,
        id: Uuid,
        slot: usize,
        value: Option<String>,
    ) -> EngineResult<()> {
        if slot >= STRING_INDEX_SLOTS {
            return Err(EngineError::Store(format!("string index slot {slot} out of range")));
        }
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(EngineError::ProcessInstanceNotFound(id))?;
        instance.string_indexes[slot] = value;
        Ok(())
    }

    async fn delete_process_instance(&self, id: Uuid) -> EngineResult<()> {
        self.lock().instances.remove(&id);
        Ok(())
    }

    async fn find_child_instance(
        &self,
        caller_flow_node_id: Uuid,
    ) -> EngineResult<Option<ProcessInstance>> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|i| i.caller_flow_node_id == Some(caller_flow_node_id))
            .cloned())
    }

    async fn save_flow_node(&self, node: &FlowNodeInstance) -> EngineResult<()> {
        self.lock().flow_nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn load_flow_node(&self, id: Uuid) -> EngineResult<Option<FlowNodeInstance>> {
        Ok(self.lock().flow_nodes.get(&id).cloned())
    }

    async fn load_flow_nodes(
        &self,
        process_instance_id: Uuid,
    ) -> EngineResult<Vec<FlowNodeInstance>> {
        let mut nodes: Vec<_> = self
            .lock()
            .flow_nodes
            .values()
            .filter(|n| n.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn update_flow_node_state(&self, id: Uuid, state: StateId) -> EngineResult<()> {
        let mut inner = self.lock();
        let node = inner
            .flow_nodes
            .get_mut(&id)
            .ok_or(EngineError::FlowNodeNotFound(id))?;
        node.state = state;
        Ok(())
    }

    async fn update_flow_node_category(
        &self,
        id: Uuid,
        category: StateCategory,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        let node = inner
            .flow_nodes
            .get_mut(&id)
            .ok_or(EngineError::FlowNodeNotFound(id))?;
        node.category = category;
        Ok(())
    }

    async fn delete_flow_node(&self, id: Uuid) -> EngineResult<()> {
        self.lock().flow_nodes.remove(&id);
        Ok(())
    }

    async fn load_data_value(
        &self,
        container: ContainerRef,
        name: &str,
    ) -> EngineResult<Option<Value>> {
        Ok(self
            .lock()
            .data
            .get(&(container.id, name.to_string()))
            .cloned())
    }

    async fn save_data_value(
        &self,
        container: ContainerRef,
        name: &str,
        value: Value,
    ) -> EngineResult<()> {
        self.lock().data.insert((container.id, name.to_string()), value);
        Ok(())
    }

    async fn delete_data_value(&self, container: ContainerRef, name: &str) -> EngineResult<()> {
        self.lock().data.remove(&(container.id, name.to_string()));
        Ok(())
    }

    async fn save_waiting_event(&self, event: &WaitingEvent) -> EngineResult<()> {
        self.lock().waiting.insert(event.id, event.clone());
        Ok(())
    }

    async fn load_waiting_event(&self, id: Uuid) -> EngineResult<Option<WaitingEvent>> {
        Ok(self.lock().waiting.get(&id).cloned())
    }

    async fn list_waiting_events(&self, kind: EventKind) -> EngineResult<Vec<WaitingEvent>> {
        let mut events: Vec<_> = self
            .lock()
            .waiting
            .values()
            .filter(|w| w.kind == kind && !w.in_progress)
            .cloned()
            .collect();
        events.sort_by_key(|w| w.id);
        Ok(events)
    }

    async fn claim_waiting_event(&self, id: Uuid) -> EngineResult<bool> {
        let mut inner = self.lock();
        match inner.waiting.get_mut(&id) {
            None => Err(EngineError::EventNotFound(id)),
            Some(event) if event.in_progress => Ok(false),
            Some(event) => {
                event.in_progress = true;
                Ok(true)
            }
        }
    }

    async fn release_waiting_event(&self, id: Uuid) -> EngineResult<()> {
        let mut inner = self.lock();
        let event = inner
            .waiting
            .get_mut(&id)
            .ok_or(EngineError::EventNotFound(id))?;
        event.in_progress = false;
        Ok(())
    }

    async fn delete_waiting_event(&self, id: Uuid) -> EngineResult<()> {
        self.lock().waiting.remove(&id);
        Ok(())
    }

    async fn delete_waiting_events_for_node(
        &self,
        flow_node_instance_id: Uuid,
    ) -> EngineResult<()> {
        self.lock()
            .waiting
            .retain(|_, w| w.flow_node_instance_id != Some(flow_node_instance_id));
        Ok(())
    }

    async fn delete_waiting_events_for_instance(
        &self,
        process_instance_id: Uuid,
    ) -> EngineResult<()> {
        self.lock()
            .waiting
            .retain(|_, w| w.process_instance_id != Some(process_instance_id));
        Ok(())
    }

    async fn save_pending_thrown(&self, event: &ThrownEvent) -> EngineResult<()> {
        self.lock().pending_thrown.push(event.clone());
        Ok(())
    }

    async fn list_pending_thrown(&self) -> EngineResult<Vec<ThrownEvent>> {
        Ok(self.lock().pending_thrown.clone())
    }

    async fn delete_pending_thrown(&self, id: Uuid) -> EngineResult<()> {
        self.lock().pending_thrown.retain(|e| e.id != id);
        Ok(())
    }

    async fn archive_flow_node(&self, record: &ArchivedFlowNodeInstance) -> EngineResult<()> {
        self.lock()
            .archived_nodes
            .insert(record.source_id, record.clone());
        Ok(())
    }

    async fn archive_process_instance(
        &self,
        record: &ArchivedProcessInstance,
    ) -> EngineResult<()> {
        self.lock()
            .archived_instances
            .insert(record.source_id, record.clone());
        Ok(())
    }

    async fn load_archived_flow_node(
        &self,
        source_id: Uuid,
    ) -> EngineResult<Option<ArchivedFlowNodeInstance>> {
        Ok(self.lock().archived_nodes.get(&source_id).cloned())
    }

    async fn load_archived_process_instance(
        &self,
        source_id: Uuid,
    ) -> EngineResult<Option<ArchivedProcessInstance>> {
        Ok(self.lock().archived_instances.get(&source_id).cloned())
    }

    async fn save_incident(&self, incident: &Incident) -> EngineResult<()> {
        self.lock().incidents.push(incident.clone());
        Ok(())
    }

    async fn load_incidents(&self, tenant_id: TenantId) -> EngineResult<Vec<Incident>> {
        Ok(self
            .lock()
            .incidents
            .iter()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> EngineResult<u64> {
        let mut inner = self.lock();
        let log = inner.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> EngineResult<Vec<(u64, RuntimeEvent)>> {
        Ok(self
            .lock()
            .events
            .get(&instance_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Keyed mutexes for single-node mutual exclusion.
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: Uuid) -> EngineResult<LockGuard> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| EngineError::Lock("lock table poisoned".into()))?;
            locks.entry(key).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(LockGuard::new(Box::new(guard)))
    }
}

/// Records incident reports; never fails.
#[derive(Default)]
pub struct RecordingIncidentChannel {
    reports: Mutex<Vec<(TenantId, Incident)>>,
}

impl RecordingIncidentChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().expect("reports poisoned").len()
    }

    pub fn reports(&self) -> Vec<(TenantId, Incident)> {
        self.reports.lock().expect("reports poisoned").clone()
    }
}

#[async_trait]
impl IncidentChannel for RecordingIncidentChannel {
    async fn report(&self, tenant_id: TenantId, incident: &Incident) {
        tracing::error!(
            tenant_id,
            incident_id = %incident.id,
            description = %incident.description,
            "incident reported"
        );
        self.reports
            .lock()
            .expect("reports poisoned")
            .push((tenant_id, incident.clone()));
    }
}

/// Minimal evaluator for in-memory use: `$name` reads the context,
/// anything that parses as JSON is a literal, the rest is a string.
pub struct ContextEvaluator;

#[async_trait]
impl ExpressionEvaluator for ContextEvaluator {
    async fn evaluate(
        &self,
        expression: &Expression,
        context: &ExpressionContext,
    ) -> EngineResult<Value> {
        let content = expression.content.as_str();
        if let Some(name) = content.strip_prefix('$') {
            return Ok(context.values.get(name).cloned().unwrap_or(Value::Null));
        }
        match serde_json::from_str(content) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(content.to_string())),
        }
    }
}

/// Definition service over a fixed set of definitions.
#[derive(Default)]
pub struct StaticDefinitionService {
    definitions: HashMap<String, ProcessDefinition>,
}

impl StaticDefinitionService {
    pub fn new(definitions: impl IntoIterator<Item = ProcessDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }
}

#[async_trait]
impl ProcessDefinitionService for StaticDefinitionService {
    async fn definition(&self, id: &str) -> EngineResult<Option<ProcessDefinition>> {
        Ok(self.definitions.get(id).cloned())
    }
}

#[cfg(test)]
pub fn test_instance(definition_id: &str) -> ProcessInstance {
    let id = Uuid::now_v7();
    ProcessInstance {
        id,
        definition_id: definition_id.into(),
        name: definition_id.into(),
        state: ProcessInstanceState::Started,
        string_indexes: std::array::from_fn(|_| None),
        started_by: Uuid::now_v7(),
        started_by_substitute: None,
        caller_flow_node_id: None,
        caller_process_instance_id: None,
        root_process_instance_id: id,
        created_at: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let event = WaitingEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Message,
            name: "go".into(),
            error_code: None,
            process_definition_id: "proc".into(),
            flow_node_definition_name: None,
            flow_node_instance_id: None,
            process_instance_id: None,
            scope_flow_node_id: None,
            in_progress: false,
        };
        store.save_waiting_event(&event).await.unwrap();

        assert!(store.claim_waiting_event(event.id).await.unwrap());
        assert!(!store.claim_waiting_event(event.id).await.unwrap());
        // Claimed waiters drop out of match queries.
        assert!(store
            .list_waiting_events(EventKind::Message)
            .await
            .unwrap()
            .is_empty());

        store.release_waiting_event(event.id).await.unwrap();
        assert!(store.claim_waiting_event(event.id).await.unwrap());
    }

    #[tokio::test]
    async fn claim_of_consumed_event_reports_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        match store.claim_waiting_event(id).await {
            Err(EngineError::EventNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn archive_round_trip_preserves_identity() {
        let store = MemoryStore::new();
        let instance = test_instance("billing");
        let record = ArchivedProcessInstance::of(
            &ProcessInstance {
                state: ProcessInstanceState::Completed,
                string_indexes: [
                    Some("north".into()),
                    None,
                    None,
                    None,
                    Some("priority".into()),
                ],
                ..instance.clone()
            },
            now_ms(),
        );
        store.archive_process_instance(&record).await.unwrap();

        let read = store
            .load_archived_process_instance(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.source_id, instance.id);
        assert_eq!(read.state, ProcessInstanceState::Completed);
        assert_eq!(read.string_indexes[0].as_deref(), Some("north"));
        assert_eq!(read.string_indexes[4].as_deref(), Some("priority"));
    }

    #[tokio::test]
    async fn lock_service_serializes_same_key() {
        let locks = Arc::new(MemoryLockService::new());
        let key = Uuid::now_v7();
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(key).await.unwrap();
                let value = { *counter.lock().unwrap() };
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = value + 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
