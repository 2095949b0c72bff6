use crate::error::{EngineError, EngineResult};
use crate::events::RuntimeEvent;
use crate::store::EngineStore;
use crate::types::*;
use std::sync::Arc;
use uuid::Uuid;

/// Registers waiting catch events and thrown events and computes
/// couples between them.
///
/// Messages and signals are matched by [`EventCorrelationEngine::fire_event`];
/// boundary errors are resolved against the chain of ancestor process
/// instances by [`EventCorrelationEngine::boundary_handler_for`]. A couple
/// may only be executed after [`EventCorrelationEngine::claim`] succeeded,
/// which is what makes consumption at-most-once under concurrent workers.
pub struct EventCorrelationEngine {
    store: Arc<dyn EngineStore>,
}

impl EventCorrelationEngine {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    pub async fn register_waiting_event(&self, event: WaitingEvent) -> EngineResult<()> {
        self.store.save_waiting_event(&event).await?;
        if let Some(instance_id) = event.process_instance_id {
            self.store
                .append_event(
                    instance_id,
                    &RuntimeEvent::WaitingEventRegistered {
                        event_id: event.id,
                        kind: event.kind,
                    },
                )
                .await?;
        }
        tracing::debug!(event_id = %event.id, kind = ?event.kind, "waiting event registered");
        Ok(())
    }

    /// Match a thrown message or signal against the registered waiters.
    ///
    /// Messages couple with at most one waiter; a message with no match
    /// is kept for deferred delivery. Signals broadcast: every matching
    /// waiter yields a couple. Waiters marked in-progress never match.
    pub async fn fire_event(&self, thrown: ThrownEvent) -> EngineResult<Vec<EventCouple>> {
        let waiters = self.store.list_waiting_events(thrown.kind).await?;
        let couples: Vec<EventCouple> = match thrown.kind {
            EventKind::Message => waiters
                .into_iter()
                .filter(|w| Self::message_matches(w, &thrown))
                .take(1)
                .map(|waiting| EventCouple {
                    waiting,
                    thrown: thrown.clone(),
                })
                .collect(),
            EventKind::Signal => waiters
                .into_iter()
                .filter(|w| w.name == thrown.name)
                .map(|waiting| EventCouple {
                    waiting,
                    thrown: thrown.clone(),
                })
                .collect(),
            EventKind::Error => {
                tracing::warn!(
                    name = %thrown.name,
                    "error events are matched through boundary resolution, not fire_event"
                );
                Vec::new()
            }
        };

        if couples.is_empty() && thrown.kind == EventKind::Message {
            self.store.save_pending_thrown(&thrown).await?;
            tracing::debug!(name = %thrown.name, "message kept for deferred delivery");
            return Ok(couples);
        }

        for couple in &couples {
            if let Some(instance_id) = couple.waiting.process_instance_id {
                self.store
                    .append_event(
                        instance_id,
                        &RuntimeEvent::CoupleMatched {
                            waiting_event_id: couple.waiting.id,
                            thrown_event_id: thrown.id,
                        },
                    )
                    .await?;
            }
        }
        Ok(couples)
    }

    fn message_matches(waiting: &WaitingEvent, thrown: &ThrownEvent) -> bool {
        if waiting.name != thrown.name {
            return false;
        }
        if thrown.target_process.as_deref() != Some(waiting.process_definition_id.as_str()) {
            return false;
        }
        match (&thrown.target_flow_node, &waiting.flow_node_definition_name) {
            (Some(target), Some(name)) => target == name,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Mark a waiter in-progress before dispatch. `Ok(false)` and
    /// `Err(EventNotFound)` both mean another worker got there first.
    pub async fn claim(&self, waiting_event_id: Uuid) -> EngineResult<bool> {
        let claimed = self.store.claim_waiting_event(waiting_event_id).await?;
        if !claimed {
            tracing::debug!(%waiting_event_id, "waiter already in progress");
        }
        Ok(claimed)
    }

    /// Crash recovery: return a claimed waiter to matching.
    pub async fn release(&self, waiting_event_id: Uuid) -> EngineResult<()> {
        self.store.release_waiting_event(waiting_event_id).await
    }

    /// Drop the waiters a dying node registered so they stop matching.
    pub async fn withdraw_node_waiters(&self, flow_node_instance_id: Uuid) -> EngineResult<()> {
        self.store
            .delete_waiting_events_for_node(flow_node_instance_id)
            .await
    }

    /// Drop every waiter scoped to a torn-down instance.
    pub async fn withdraw_instance_waiters(&self, process_instance_id: Uuid) -> EngineResult<()> {
        self.store
            .delete_waiting_events_for_instance(process_instance_id)
            .await
    }

    /// Delete a claimed waiter. Must only be called by the worker that
    /// claimed it.
    pub async fn consume(&self, couple: &EventCouple) -> EngineResult<()> {
        let id = couple.waiting.id;
        if self.store.load_waiting_event(id).await?.is_none() {
            return Err(EngineError::EventNotFound(id));
        }
        self.store.delete_waiting_event(id).await?;
        if let Some(instance_id) = couple.waiting.process_instance_id {
            self.store
                .append_event(
                    instance_id,
                    &RuntimeEvent::CoupleConsumed { waiting_event_id: id },
                )
                .await?;
        }
        Ok(())
    }

    /// Resolve an uncaught error thrown from `throwing_node` against
    /// boundary waiters, searching outward: boundaries attached to the
    /// throwing node and its enclosing activities first, then, per
    /// ancestor process instance, boundaries on the call activity that
    /// invoked it. Within one level an exact error-code match beats a
    /// catch-all; absent both, the search climbs to the next ancestor.
    pub async fn boundary_handler_for(
        &self,
        throwing_node: &FlowNodeInstance,
        error_code: Option<&str>,
    ) -> EngineResult<Option<WaitingEvent>> {
        // Scopes inside the throwing instance: the node itself, then
        // enclosing activities (sub-processes).
        let mut scope = Some(throwing_node.id);
        let mut parent = throwing_node.parent_flow_node_id;
        while let Some(scope_id) = scope {
            if let Some(waiter) = self.error_waiter_in_scope(scope_id, error_code).await? {
                return Ok(Some(waiter));
            }
            scope = parent;
            parent = match parent {
                Some(parent_id) => self
                    .store
                    .load_flow_node(parent_id)
                    .await?
                    .and_then(|n| n.parent_flow_node_id),
                None => None,
            };
        }

        // Ancestor instances: the boundary on each invoking call
        // activity, outward until the root.
        let mut instance_id = throwing_node.process_instance_id;
        loop {
            let instance = self
                .store
                .load_process_instance(instance_id)
                .await?
                .ok_or(EngineError::ProcessInstanceNotFound(instance_id))?;
            let Some(caller_node_id) = instance.caller_flow_node_id else {
                return Ok(None);
            };
            if let Some(waiter) = self.error_waiter_in_scope(caller_node_id, error_code).await? {
                return Ok(Some(waiter));
            }
            match instance.caller_process_instance_id {
                Some(caller) => instance_id = caller,
                None => return Ok(None),
            }
        }
    }

    async fn error_waiter_in_scope(
        &self,
        scope_flow_node_id: Uuid,
        error_code: Option<&str>,
    ) -> EngineResult<Option<WaitingEvent>> {
        let waiters: Vec<WaitingEvent> = self
            .store
            .list_waiting_events(EventKind::Error)
            .await?
            .into_iter()
            .filter(|w| w.scope_flow_node_id == Some(scope_flow_node_id))
            .collect();

        if let Some(code) = error_code {
            if let Some(exact) = waiters
                .iter()
                .find(|w| w.error_code.as_deref() == Some(code))
            {
                return Ok(Some(exact.clone()));
            }
        }
        // A None code catches everything, re-thrown errors included.
        Ok(waiters.into_iter().find(|w| w.error_code.is_none()))
    }

    /// Re-match messages that found no waiter at fire time. Called when
    /// a process completes and dependent definitions may now have start
    /// waiters registered.
    pub async fn deferred_couples(&self) -> EngineResult<Vec<EventCouple>> {
        let mut couples = Vec::new();
        for thrown in self.store.list_pending_thrown().await? {
            let matched: Vec<EventCouple> = self
                .store
                .list_waiting_events(EventKind::Message)
                .await?
                .into_iter()
                .filter(|w| Self::message_matches(w, &thrown))
                .take(1)
                .map(|waiting| EventCouple {
                    waiting,
                    thrown: thrown.clone(),
                })
                .collect();
            if !matched.is_empty() {
                self.store.delete_pending_thrown(thrown.id).await?;
                couples.extend(matched);
            }
        }
        Ok(couples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn waiter(kind: EventKind, name: &str) -> WaitingEvent {
        WaitingEvent {
            id: Uuid::now_v7(),
            kind,
            name: name.into(),
            error_code: None,
            process_definition_id: "target-proc".into(),
            flow_node_definition_name: None,
            flow_node_instance_id: Some(Uuid::now_v7()),
            process_instance_id: Some(Uuid::now_v7()),
            scope_flow_node_id: None,
            in_progress: false,
        }
    }

    fn message(name: &str) -> ThrownEvent {
        ThrownEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Message,
            name: name.into(),
            error_code: None,
            target_process: Some("target-proc".into()),
            target_flow_node: None,
            correlation_data: Default::default(),
            source_process_instance_id: None,
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> EventCorrelationEngine {
        EventCorrelationEngine::new(store.clone() as Arc<dyn EngineStore>)
    }

    #[tokio::test]
    async fn message_matches_name_and_target_process() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        engine
            .register_waiting_event(waiter(EventKind::Message, "paid"))
            .await
            .unwrap();

        let couples = engine.fire_event(message("paid")).await.unwrap();
        assert_eq!(couples.len(), 1);

        let mut wrong_target = message("paid");
        wrong_target.target_process = Some("other-proc".into());
        let couples = engine.fire_event(wrong_target).await.unwrap();
        assert!(couples.is_empty());
    }

    #[tokio::test]
    async fn targeted_message_requires_flow_node_name_equality() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let mut w = waiter(EventKind::Message, "paid");
        w.flow_node_definition_name = Some("catchPayment".into());
        engine.register_waiting_event(w).await.unwrap();

        let mut thrown = message("paid");
        thrown.target_flow_node = Some("someOtherCatch".into());
        assert!(engine.fire_event(thrown).await.unwrap().is_empty());

        let mut thrown = message("paid");
        thrown.target_flow_node = Some("catchPayment".into());
        assert_eq!(engine.fire_event(thrown).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signals_broadcast_to_all_matching_waiters() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        for _ in 0..3 {
            engine
                .register_waiting_event(waiter(EventKind::Signal, "halt"))
                .await
                .unwrap();
        }
        engine
            .register_waiting_event(waiter(EventKind::Signal, "other"))
            .await
            .unwrap();

        let thrown = ThrownEvent {
            kind: EventKind::Signal,
            target_process: None,
            ..message("halt")
        };
        assert_eq!(engine.fire_event(thrown).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn couple_is_consumed_at_most_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        engine
            .register_waiting_event(waiter(EventKind::Message, "go"))
            .await
            .unwrap();

        let couples = engine.fire_event(message("go")).await.unwrap();
        let couple = couples.into_iter().next().unwrap();

        // Two workers race for the same waiter.
        assert!(engine.claim(couple.waiting.id).await.unwrap());
        assert!(!engine.claim(couple.waiting.id).await.unwrap());

        engine.consume(&couple).await.unwrap();
        match engine.claim(couple.waiting.id).await {
            Err(EngineError::EventNotFound(_)) => {}
            other => panic!("expected EventNotFound, got {other:?}"),
        }
        // A second identical throw finds nothing to couple with and is
        // parked for deferred delivery instead.
        assert!(engine.fire_event(message("go")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_waiter_matches_again() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        engine
            .register_waiting_event(waiter(EventKind::Message, "go"))
            .await
            .unwrap();
        let couple = engine
            .fire_event(message("go"))
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        assert!(engine.claim(couple.waiting.id).await.unwrap());
        engine.release(couple.waiting.id).await.unwrap();
        assert!(engine.claim(couple.waiting.id).await.unwrap());
    }

    // ── Boundary error resolution ──

    struct Nesting {
        store: Arc<MemoryStore>,
        throwing_node: FlowNodeInstance,
        level1_call_activity: Uuid,
        level2_call_activity: Uuid,
    }

    /// Root P2 -> call activity CA2 -> P1 -> call activity CA1 -> P0,
    /// with the throwing node inside P0.
    async fn nested() -> Nesting {
        let store = Arc::new(MemoryStore::new());
        let p2 = crate::store_memory::test_instance("outer");
        let ca2 = Uuid::now_v7();
        let mut p1 = crate::store_memory::test_instance("middle");
        p1.caller_flow_node_id = Some(ca2);
        p1.caller_process_instance_id = Some(p2.id);
        p1.root_process_instance_id = p2.id;
        let ca1 = Uuid::now_v7();
        let mut p0 = crate::store_memory::test_instance("inner");
        p0.caller_flow_node_id = Some(ca1);
        p0.caller_process_instance_id = Some(p1.id);
        p0.root_process_instance_id = p2.id;

        for instance in [&p2, &p1, &p0] {
            store.save_process_instance(instance).await.unwrap();
        }

        let throwing_node = FlowNodeInstance {
            id: Uuid::now_v7(),
            definition_id: "throwError".into(),
            name: "throwError".into(),
            node_type: FlowNodeType::EndEvent,
            state: StateId::Executing,
            category: StateCategory::Normal,
            parent_flow_node_id: None,
            process_instance_id: p0.id,
            root_process_instance_id: p2.id,
        };
        store.save_flow_node(&throwing_node).await.unwrap();

        Nesting {
            store,
            throwing_node,
            level1_call_activity: ca1,
            level2_call_activity: ca2,
        }
    }

    fn error_waiter(scope: Uuid, code: Option<&str>) -> WaitingEvent {
        WaitingEvent {
            id: Uuid::now_v7(),
            kind: EventKind::Error,
            name: String::new(),
            error_code: code.map(Into::into),
            process_definition_id: "any".into(),
            flow_node_definition_name: None,
            flow_node_instance_id: Some(Uuid::now_v7()),
            process_instance_id: Some(Uuid::now_v7()),
            scope_flow_node_id: Some(scope),
            in_progress: false,
        }
    }

    /// error1 thrown at level 0; the level-1 boundary only catches
    /// error2, the level-2 boundary catches error1. The outer boundary
    /// wins and the non-matching inner one is never selected.
    #[tokio::test]
    async fn outer_exact_match_wins_over_inner_mismatch() {
        let n = nested().await;
        let engine = engine(&n.store);
        let inner = error_waiter(n.level1_call_activity, Some("error2"));
        let outer = error_waiter(n.level2_call_activity, Some("error1"));
        engine.register_waiting_event(inner.clone()).await.unwrap();
        engine.register_waiting_event(outer.clone()).await.unwrap();

        let matched = engine
            .boundary_handler_for(&n.throwing_node, Some("error1"))
            .await
            .unwrap()
            .expect("outer boundary must catch");
        assert_eq!(matched.id, outer.id);
    }

    #[tokio::test]
    async fn exact_code_beats_catch_all_at_the_same_level() {
        let n = nested().await;
        let engine = engine(&n.store);
        let catch_all = error_waiter(n.level1_call_activity, None);
        let exact = error_waiter(n.level1_call_activity, Some("error1"));
        engine.register_waiting_event(catch_all).await.unwrap();
        engine.register_waiting_event(exact.clone()).await.unwrap();

        let matched = engine
            .boundary_handler_for(&n.throwing_node, Some("error1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, exact.id);
    }

    #[tokio::test]
    async fn closer_catch_all_beats_outer_exact_match() {
        let n = nested().await;
        let engine = engine(&n.store);
        let inner_catch_all = error_waiter(n.level1_call_activity, None);
        let outer_exact = error_waiter(n.level2_call_activity, Some("error1"));
        engine
            .register_waiting_event(inner_catch_all.clone())
            .await
            .unwrap();
        engine.register_waiting_event(outer_exact).await.unwrap();

        let matched = engine
            .boundary_handler_for(&n.throwing_node, Some("error1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, inner_catch_all.id);
    }

    /// Catch-all policy: a re-thrown error (same code, thrown again
    /// from a level that caught it with a catch-all) is a fresh throw
    /// and an outer catch-all matches it too.
    #[tokio::test]
    async fn catch_all_matches_rethrown_errors() {
        let n = nested().await;
        let engine = engine(&n.store);
        let outer_catch_all = error_waiter(n.level2_call_activity, None);
        engine
            .register_waiting_event(outer_catch_all.clone())
            .await
            .unwrap();

        // First resolution at level 1 was a catch-all that re-threw:
        // the throwing node for the second resolution sits in P1.
        let p1_id = n
            .store
            .load_process_instance(n.throwing_node.process_instance_id)
            .await
            .unwrap()
            .unwrap()
            .caller_process_instance_id
            .unwrap();
        let rethrowing_node = FlowNodeInstance {
            process_instance_id: p1_id,
            ..n.throwing_node.clone()
        };

        let matched = engine
            .boundary_handler_for(&rethrowing_node, Some("error1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, outer_catch_all.id);
    }

    #[tokio::test]
    async fn uncaught_when_no_level_matches() {
        let n = nested().await;
        let engine = engine(&n.store);
        let other_code = error_waiter(n.level1_call_activity, Some("error2"));
        engine.register_waiting_event(other_code).await.unwrap();

        let matched = engine
            .boundary_handler_for(&n.throwing_node, Some("error9"))
            .await
            .unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn unmatched_message_is_delivered_deferred() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        assert!(engine.fire_event(message("late")).await.unwrap().is_empty());
        assert!(engine.deferred_couples().await.unwrap().is_empty());

        engine
            .register_waiting_event(waiter(EventKind::Message, "late"))
            .await
            .unwrap();
        let couples = engine.deferred_couples().await.unwrap();
        assert_eq!(couples.len(), 1);
        // Delivered once: the pending record is gone.
        assert!(engine.deferred_couples().await.unwrap().is_empty());
    }
}
