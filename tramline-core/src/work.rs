use crate::error::{EngineError, EngineResult, Staleness};
use crate::store::{EngineStore, IncidentChannel};
use crate::types::{now_ms, Incident, TenantId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const CTX_TENANT_ID: &str = "tenantId";
const CTX_PROCESS_INSTANCE_ID: &str = "processInstanceId";
const CTX_FLOW_NODE_INSTANCE_ID: &str = "flowNodeInstanceId";
const CTX_THROWN_EVENT_ID: &str = "thrownEventId";

/// Per-execution scratch state threaded through a decorator chain.
/// Each decorator deposits the identifiers it knows about before
/// delegating inward.
#[derive(Debug, Default)]
pub struct WorkContext {
    values: BTreeMap<String, Value>,
}

impl WorkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_owned(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set_tenant_id(&mut self, tenant_id: TenantId) {
        self.set(CTX_TENANT_ID, Value::from(tenant_id));
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.get(CTX_TENANT_ID).and_then(Value::as_i64)
    }

    pub fn set_process_instance_id(&mut self, id: Uuid) {
        self.set(CTX_PROCESS_INSTANCE_ID, Value::from(id.to_string()));
    }

    pub fn process_instance_id(&self) -> Option<Uuid> {
        self.get(CTX_PROCESS_INSTANCE_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_flow_node_instance_id(&mut self, id: Uuid) {
        self.set(CTX_FLOW_NODE_INSTANCE_ID, Value::from(id.to_string()));
    }

    pub fn flow_node_instance_id(&self) -> Option<Uuid> {
        self.get(CTX_FLOW_NODE_INSTANCE_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// A unit of background work submitted to the scheduler.
///
/// `work` does the job; `handle_failure` is the unit's own recovery
/// path, invoked by [`FailureHandlingWork`] only for real (non-stale)
/// failures. Units never see benign staleness.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Human-readable description, used for logs and incident reports.
    fn description(&self) -> String;

    /// Key for mutual exclusion, usually a process instance id. `None`
    /// runs without a lock.
    fn lock_key(&self) -> Option<Uuid> {
        None
    }

    async fn work(&self, context: &mut WorkContext) -> EngineResult<()>;

    async fn handle_failure(
        &self,
        error: &EngineError,
        _context: &mut WorkContext,
    ) -> EngineResult<()> {
        tracing::warn!(%error, unit = %self.description(), "no failure handler; dropping");
        Ok(())
    }
}

/// Deposits the owning process instance id before delegating.
pub struct ProcessContextWork {
    pub process_instance_id: Uuid,
    pub inner: Box<dyn WorkUnit>,
}

#[async_trait]
impl WorkUnit for ProcessContextWork {
    fn description(&self) -> String {
        format!(
            "{} [process {}]",
            self.inner.description(),
            self.process_instance_id
        )
    }

    fn lock_key(&self) -> Option<Uuid> {
        self.inner.lock_key()
    }

    async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
        context.set_process_instance_id(self.process_instance_id);
        self.inner.work(context).await
    }

    async fn handle_failure(
        &self,
        error: &EngineError,
        context: &mut WorkContext,
    ) -> EngineResult<()> {
        context.set_process_instance_id(self.process_instance_id);
        self.inner.handle_failure(error, context).await
    }
}

/// Deposits the flow node and process instance ids before delegating.
pub struct FlowNodeContextWork {
    pub flow_node_instance_id: Uuid,
    pub process_instance_id: Uuid,
    pub inner: Box<dyn WorkUnit>,
}

#[async_trait]
impl WorkUnit for FlowNodeContextWork {
    fn description(&self) -> String {
        format!(
            "{} [node {}]",
            self.inner.description(),
            self.flow_node_instance_id
        )
    }

    fn lock_key(&self) -> Option<Uuid> {
        self.inner.lock_key()
    }

    async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
        context.set_process_instance_id(self.process_instance_id);
        context.set_flow_node_instance_id(self.flow_node_instance_id);
        self.inner.work(context).await
    }

    async fn handle_failure(
        &self,
        error: &EngineError,
        context: &mut WorkContext,
    ) -> EngineResult<()> {
        context.set_process_instance_id(self.process_instance_id);
        context.set_flow_node_instance_id(self.flow_node_instance_id);
        self.inner.handle_failure(error, context).await
    }
}

/// Deposits the thrown event id driving a message delivery.
pub struct MessageContextWork {
    pub thrown_event_id: Uuid,
    pub inner: Box<dyn WorkUnit>,
}

#[async_trait]
impl WorkUnit for MessageContextWork {
    fn description(&self) -> String {
        format!(
            "{} [thrown event {}]",
            self.inner.description(),
            self.thrown_event_id
        )
    }

    fn lock_key(&self) -> Option<Uuid> {
        self.inner.lock_key()
    }

    async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
        context.set(CTX_THROWN_EVENT_ID, Value::from(self.thrown_event_id.to_string()));
        self.inner.work(context).await
    }

    async fn handle_failure(
        &self,
        error: &EngineError,
        context: &mut WorkContext,
    ) -> EngineResult<()> {
        self.inner.handle_failure(error, context).await
    }
}

/// Outermost wrapper on every scheduled unit. Its `work` never returns
/// an error:
///
/// - benign staleness (entity vanished, transition already taken) is
///   logged and swallowed;
/// - a real failure is routed to the inner unit's `handle_failure`;
/// - a failure of the failure handler produces exactly one incident
///   through the store and the operator channel, then returns `Ok`.
pub struct FailureHandlingWork {
    pub tenant_id: TenantId,
    pub store: Arc<dyn EngineStore>,
    pub incidents: Arc<dyn IncidentChannel>,
    pub inner: Box<dyn WorkUnit>,
}

#[async_trait]
impl WorkUnit for FailureHandlingWork {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn lock_key(&self) -> Option<Uuid> {
        self.inner.lock_key()
    }

    async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
        context.set_tenant_id(self.tenant_id);
        let error = match self.inner.work(context).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match error.staleness() {
            Staleness::BenignNotFound => {
                tracing::info!(
                    %error,
                    unit = %self.inner.description(),
                    "work target gone; treating as already handled"
                );
                Ok(())
            }
            Staleness::BenignTerminalTransition => {
                tracing::info!(
                    %error,
                    unit = %self.inner.description(),
                    "transition already taken elsewhere; skipping"
                );
                Ok(())
            }
            Staleness::Real => {
                tracing::warn!(%error, unit = %self.inner.description(), "work failed");
                if let Err(handling) = self.inner.handle_failure(&error, context).await {
                    self.report_incident(context, &error, &handling).await;
                }
                Ok(())
            }
        }
    }
}

impl FailureHandlingWork {
    async fn report_incident(
        &self,
        context: &WorkContext,
        root_cause: &EngineError,
        handling: &EngineError,
    ) {
        let incident = Incident {
            id: Uuid::now_v7(),
            tenant_id: self.tenant_id,
            description: self.inner.description(),
            recovery_procedure:
                "inspect the audit log of the affected process instance and retry or abort manually"
                    .to_owned(),
            root_cause: root_cause.to_string(),
            handling_failure: handling.to_string(),
            created_at: now_ms(),
        };
        tracing::error!(
            incident_id = %incident.id,
            root_cause = %incident.root_cause,
            handling_failure = %incident.handling_failure,
            "failure handling failed; incident raised"
        );
        if let Err(store_err) = self.store.save_incident(&incident).await {
            tracing::error!(%store_err, incident_id = %incident.id, "could not persist incident");
        }
        if let Some(instance_id) = context.process_instance_id() {
            if let Err(audit_err) = self
                .store
                .append_event(
                    instance_id,
                    &crate::events::RuntimeEvent::IncidentReported {
                        incident_id: incident.id,
                    },
                )
                .await
            {
                tracing::error!(%audit_err, incident_id = %incident.id, "could not audit incident");
            }
        }
        self.incidents.report(self.tenant_id, &incident).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::{MemoryStore, RecordingIncidentChannel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedUnit {
        work_error: Option<EngineError>,
        handler_error: Option<EngineError>,
        work_calls: AtomicUsize,
        handler_calls: Arc<AtomicUsize>,
    }

    impl ScriptedUnit {
        fn failing(work_error: EngineError, handler_error: Option<EngineError>) -> Self {
            Self {
                work_error: Some(work_error),
                handler_error,
                work_calls: AtomicUsize::new(0),
                handler_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl WorkUnit for &'static ScriptedUnit {
        fn description(&self) -> String {
            "scripted unit".into()
        }

        async fn work(&self, _context: &mut WorkContext) -> EngineResult<()> {
            self.work_calls.fetch_add(1, Ordering::SeqCst);
            match &self.work_error {
                Some(e) => Err(clone_error(e)),
                None => Ok(()),
            }
        }

        async fn handle_failure(
            &self,
            _error: &EngineError,
            _context: &mut WorkContext,
        ) -> EngineResult<()> {
            self.handler_calls.fetch_add(1, Ordering::SeqCst);
            match &self.handler_error {
                Some(e) => Err(clone_error(e)),
                None => Ok(()),
            }
        }
    }

    // EngineError is not Clone; rebuild the variants the tests use.
    fn clone_error(error: &EngineError) -> EngineError {
        match error {
            EngineError::FlowNodeNotFound(id) => EngineError::FlowNodeNotFound(*id),
            EngineError::Store(msg) => EngineError::Store(msg.clone()),
            EngineError::Evaluation(msg) => EngineError::Evaluation(msg.clone()),
            other => EngineError::Store(other.to_string()),
        }
    }

    fn wrap(
        unit: &'static ScriptedUnit,
        store: &Arc<MemoryStore>,
        incidents: &Arc<RecordingIncidentChannel>,
    ) -> FailureHandlingWork {
        FailureHandlingWork {
            tenant_id: 7,
            store: store.clone(),
            incidents: incidents.clone() as Arc<dyn IncidentChannel>,
            inner: Box::new(unit),
        }
    }

    fn leak(unit: ScriptedUnit) -> &'static ScriptedUnit {
        Box::leak(Box::new(unit))
    }

    #[tokio::test]
    async fn benign_not_found_never_reaches_the_failure_handler() {
        let unit = leak(ScriptedUnit::failing(
            EngineError::FlowNodeNotFound(Uuid::now_v7()),
            None,
        ));
        let store = Arc::new(MemoryStore::new());
        let incidents = Arc::new(RecordingIncidentChannel::new());
        let wrapper = wrap(unit, &store, &incidents);

        wrapper.work(&mut WorkContext::new()).await.unwrap();

        assert_eq!(unit.handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(incidents.count(), 0);
    }

    #[tokio::test]
    async fn real_failure_reaches_the_failure_handler_without_incident() {
        let unit = leak(ScriptedUnit::failing(
            EngineError::Store("connection reset".into()),
            None,
        ));
        let store = Arc::new(MemoryStore::new());
        let incidents = Arc::new(RecordingIncidentChannel::new());
        let wrapper = wrap(unit, &store, &incidents);

        wrapper.work(&mut WorkContext::new()).await.unwrap();

        assert_eq!(unit.handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(incidents.count(), 0);
        assert!(store.load_incidents(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_failure_handler_raises_exactly_one_incident() {
        let unit = leak(ScriptedUnit::failing(
            EngineError::Store("connection reset".into()),
            Some(EngineError::Store("still down".into())),
        ));
        let store = Arc::new(MemoryStore::new());
        let incidents = Arc::new(RecordingIncidentChannel::new());
        let wrapper = wrap(unit, &store, &incidents);

        // Never propagates, even on the double failure.
        wrapper.work(&mut WorkContext::new()).await.unwrap();

        assert_eq!(unit.handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(incidents.count(), 1);
        let persisted = store.load_incidents(7).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].root_cause.contains("connection reset"));
        assert!(persisted[0].handling_failure.contains("still down"));
    }

    #[tokio::test]
    async fn decorators_deposit_their_ids_and_delegate_lock_key() {
        struct ContextCheck;

        #[async_trait]
        impl WorkUnit for ContextCheck {
            fn description(&self) -> String {
                "context check".into()
            }

            fn lock_key(&self) -> Option<Uuid> {
                Some(Uuid::nil())
            }

            async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
                assert!(context.process_instance_id().is_some());
                assert!(context.flow_node_instance_id().is_some());
                assert_eq!(context.tenant_id(), Some(7));
                Ok(())
            }
        }

        let process_instance_id = Uuid::now_v7();
        let node_id = Uuid::now_v7();
        let store = Arc::new(MemoryStore::new());
        let incidents = Arc::new(RecordingIncidentChannel::new());
        let chain = FailureHandlingWork {
            tenant_id: 7,
            store,
            incidents,
            inner: Box::new(FlowNodeContextWork {
                flow_node_instance_id: node_id,
                process_instance_id,
                inner: Box::new(ContextCheck),
            }),
        };

        assert_eq!(chain.lock_key(), Some(Uuid::nil()));
        assert!(chain.description().contains(&node_id.to_string()));
        chain.work(&mut WorkContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn process_decorator_deposits_the_instance_id() {
        struct InstanceCheck(Uuid);

        #[async_trait]
        impl WorkUnit for InstanceCheck {
            fn description(&self) -> String {
                "instance check".into()
            }

            async fn work(&self, context: &mut WorkContext) -> EngineResult<()> {
                assert_eq!(context.process_instance_id(), Some(self.0));
                Ok(())
            }
        }

        let process_instance_id = Uuid::now_v7();
        let wrapped = ProcessContextWork {
            process_instance_id,
            inner: Box::new(InstanceCheck(process_instance_id)),
        };
        assert!(wrapped.description().contains(&process_instance_id.to_string()));
        wrapped.work(&mut WorkContext::new()).await.unwrap();
    }
}
