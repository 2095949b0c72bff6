use crate::error::{EngineError, EngineResult};
use crate::store::LockService;
use crate::work::{WorkContext, WorkUnit};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Durable backing for work that survives a restart. On shutdown the
/// scheduler pushes everything not yet executed here; on boot the
/// embedding application drains it back through
/// [`WorkScheduler::recover`].
#[async_trait::async_trait]
pub trait DurableWorkQueue: Send + Sync {
    async fn push_executing(&self, unit: Box<dyn WorkUnit>) -> EngineResult<()>;
    async fn drain_executing(&self, max: usize) -> EngineResult<Vec<Box<dyn WorkUnit>>>;
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Submissions beyond this bound are rejected, not buffered.
    pub queue_capacity: usize,
    /// Concurrently executing units.
    pub worker_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            worker_count: 8,
        }
    }
}

/// Bounded local work pool.
///
/// A single pump task pulls submitted units off an mpsc channel and
/// spawns them, gated by a semaphore sized to `worker_count`. Units
/// with a lock key run under the [`LockService`] guard for that key, so
/// two units touching the same process instance never interleave. A
/// full queue is a capacity problem and surfaces loudly as
/// [`EngineError::SchedulerSaturated`].
pub struct WorkScheduler {
    sender: Mutex<Option<mpsc::Sender<Box<dyn WorkUnit>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    semaphore: Arc<Semaphore>,
    shutting_down: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
    durable: Arc<dyn DurableWorkQueue>,
    worker_count: usize,
}

impl WorkScheduler {
    /// Starts the pump task; requires a running tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        locks: Arc<dyn LockService>,
        durable: Arc<dyn DurableWorkQueue>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Box<dyn WorkUnit>>(config.queue_capacity);
        let semaphore = Arc::new(Semaphore::new(config.worker_count));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let shutdown_signal = Arc::new(Notify::new());

        let pump = {
            let semaphore = semaphore.clone();
            let shutting_down = shutting_down.clone();
            let shutdown_signal = shutdown_signal.clone();
            let durable = durable.clone();
            tokio::spawn(async move {
                while let Some(unit) = receiver.recv().await {
                    if shutting_down.load(Ordering::SeqCst) {
                        Self::park_durably(&durable, unit).await;
                        continue;
                    }
                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = shutdown_signal.notified() => {
                            Self::park_durably(&durable, unit).await;
                            continue;
                        }
                    };
                    let locks = locks.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _guard = match unit.lock_key() {
                            Some(key) => match locks.acquire(key).await {
                                Ok(guard) => Some(guard),
                                Err(error) => {
                                    tracing::error!(
                                        %error,
                                        unit = %unit.description(),
                                        "lock acquisition failed; unit dropped"
                                    );
                                    return;
                                }
                            },
                            None => None,
                        };
                        let mut context = WorkContext::new();
                        if let Err(error) = unit.work(&mut context).await {
                            // Units are wrapped in failure handling and
                            // should not reach this branch.
                            tracing::error!(
                                %error,
                                unit = %unit.description(),
                                "unhandled work failure"
                            );
                        }
                    });
                }
                tracing::debug!("work pump stopped");
            })
        };

        Self {
            sender: Mutex::new(Some(sender)),
            pump: Mutex::new(Some(pump)),
            semaphore,
            shutting_down,
            shutdown_signal,
            durable,
            worker_count: config.worker_count,
        }
    }

    async fn park_durably(durable: &Arc<dyn DurableWorkQueue>, unit: Box<dyn WorkUnit>) {
        let description = unit.description();
        if let Err(error) = durable.push_executing(unit).await {
            tracing::error!(%error, unit = %description, "could not park work durably");
        } else {
            tracing::info!(unit = %description, "work parked for the next boot");
        }
    }

    /// Hand a unit to the pool. During shutdown the unit is parked in
    /// the durable queue instead of executed.
    pub fn submit(&self, unit: Box<dyn WorkUnit>) -> EngineResult<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| EngineError::Lock("scheduler sender mutex poisoned".into()))?;
        let Some(sender) = guard.as_ref() else {
            return Err(EngineError::SchedulerShutDown);
        };
        match sender.try_send(unit) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(unit)) => {
                tracing::error!(
                    unit = %unit.description(),
                    "work queue saturated; rejecting submission"
                );
                Err(EngineError::SchedulerSaturated)
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::SchedulerShutDown),
        }
    }

    /// Resubmit work parked by a previous shutdown.
    pub async fn recover(&self) -> EngineResult<usize> {
        let units = self.durable.drain_executing(usize::MAX).await?;
        let count = units.len();
        for unit in units {
            self.submit(unit)?;
        }
        if count > 0 {
            tracing::info!(count, "recovered parked work");
        }
        Ok(count)
    }

    /// Stop accepting work, park everything still queued, and wait for
    /// in-flight units to finish.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_signal.notify_one();
        let sender = self
            .sender
            .lock()
            .map_err(|_| EngineError::Lock("scheduler sender mutex poisoned".into()))?
            .take();
        drop(sender);

        let pump = self
            .pump
            .lock()
            .map_err(|_| EngineError::Lock("scheduler pump mutex poisoned".into()))?
            .take();
        if let Some(pump) = pump {
            if let Err(error) = pump.await {
                tracing::error!(%error, "work pump panicked");
            }
        }

        // All permits back means no unit is still running.
        let _drained = self
            .semaphore
            .acquire_many(self.worker_count as u32)
            .await
            .map_err(|_| EngineError::Lock("scheduler semaphore closed".into()))?;
        tracing::info!("work scheduler shut down");
        Ok(())
    }
}

/// Volatile queue for tests and single-node deployments that accept
/// losing parked work on a crash.
#[derive(Default)]
pub struct MemoryWorkQueue {
    units: Mutex<Vec<Box<dyn WorkUnit>>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.lock().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl DurableWorkQueue for MemoryWorkQueue {
    async fn push_executing(&self, unit: Box<dyn WorkUnit>) -> EngineResult<()> {
        self.units
            .lock()
            .map_err(|_| EngineError::Lock("work queue mutex poisoned".into()))?
            .push(unit);
        Ok(())
    }

    async fn drain_executing(&self, max: usize) -> EngineResult<Vec<Box<dyn WorkUnit>>> {
        let mut units = self
            .units
            .lock()
            .map_err(|_| EngineError::Lock("work queue mutex poisoned".into()))?;
        let take = max.min(units.len());
        Ok(units.drain(..take).collect())
    }
}
