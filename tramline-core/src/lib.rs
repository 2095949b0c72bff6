//! Embeddable process execution engine.
//!
//! The engine drives process instances through a flow-node lifecycle
//! state machine, correlates thrown events (messages, signals, errors)
//! with waiting catch events, applies data-mutating operation batches,
//! and schedules all of it as failure-wrapped work units on a bounded
//! local pool. Persistence, expression evaluation, process definitions,
//! locking, and incident notification are pluggable collaborators; the
//! `store_memory` module provides in-memory implementations for tests
//! and single-node use.

pub mod correlation;
pub mod error;
pub mod events;
pub mod executor;
pub mod machine;
pub mod operations;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod work;

pub use correlation::EventCorrelationEngine;
pub use error::{EngineError, EngineResult, Staleness};
pub use events::RuntimeEvent;
pub use executor::{ProcessExecutor, StartRequest, StartSelector};
pub use machine::{next_state_for, FlowNodeStateMachine, StateBehavior, StateRegistry};
pub use operations::{ExpressionContext, LeftOperandHandler, OperationExecutor};
pub use scheduler::{DurableWorkQueue, MemoryWorkQueue, SchedulerConfig, WorkScheduler};
pub use store::{
    Connector, EngineStore, ExpressionEvaluator, IncidentChannel, LockGuard, LockService,
    ProcessDefinitionService,
};
pub use store_memory::{
    ContextEvaluator, MemoryLockService, MemoryStore, RecordingIncidentChannel,
    StaticDefinitionService,
};
pub use types::*;
pub use work::{
    FailureHandlingWork, FlowNodeContextWork, MessageContextWork, ProcessContextWork, WorkContext,
    WorkUnit,
};
