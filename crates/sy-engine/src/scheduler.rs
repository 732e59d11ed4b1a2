//! Scheduler - executor pools and periodic tasks
//!
//! - `ExecutorPool`: semaphore-bounded concurrency with a bounded pending queue
//!   and a configurable queue-full policy
//! - `Scheduler`: pools keyed by name, plus periodic task registration used by
//!   timer-style consumers

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sy_common::{EngineConfig, EngineError, PoolConfig, PoolStats, RejectionPolicy, Result};

// ============================================================================
// ExecutorPool
// ============================================================================

/// Bounded pool of async workers
pub struct ExecutorPool {
    config: PoolConfig,

    /// Concurrency limit
    semaphore: Arc<Semaphore>,

    /// Accepting submissions
    running: AtomicBool,

    /// Submitted tasks not yet finished (queued + active)
    outstanding: Arc<AtomicU32>,

    /// Tasks currently holding a permit
    active_tasks: Arc<AtomicU32>,

    rejected_total: AtomicU64,

    /// Unbounded-growth warning is logged once per pool
    grow_warned: AtomicBool,
}

impl ExecutorPool {
    pub fn new(config: PoolConfig) -> Self {
        let concurrency = config.max_concurrency.max(1) as usize;

        info!(
            pool = %config.name,
            max_concurrency = concurrency,
            max_queue = config.max_queue,
            rejection = ?config.rejection,
            "Creating executor pool"
        );

        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            running: AtomicBool::new(true),
            outstanding: Arc::new(AtomicU32::new(0)),
            active_tasks: Arc::new(AtomicU32::new(0)),
            rejected_total: AtomicU64::new(0),
            grow_warned: AtomicBool::new(false),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn capacity(&self) -> u32 {
        self.config.max_concurrency.max(1).saturating_add(self.config.max_queue)
    }

    /// Queue a task. When the pool is saturated the pool's rejection policy
    /// decides: fail with `RejectedExecution`, run on the caller, or grow.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::rejected(
                format!("pool {}", self.config.name),
                "pool is shut down",
            ));
        }

        let previous = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if previous >= self.capacity() {
            match self.config.rejection {
                RejectionPolicy::Reject => {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        pool = %self.config.name,
                        outstanding = previous,
                        capacity = self.capacity(),
                        "Pool saturated, rejecting task"
                    );
                    return Err(EngineError::rejected(
                        format!("pool {}", self.config.name),
                        "queue is full",
                    ));
                }
                RejectionPolicy::CallerRuns => {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    debug!(pool = %self.config.name, "Pool saturated, running task on caller");
                    task.await;
                    return Ok(());
                }
                RejectionPolicy::Grow => {
                    if !self.grow_warned.swap(true, Ordering::SeqCst) {
                        warn!(
                            pool = %self.config.name,
                            capacity = self.capacity(),
                            "Pool saturated with unbounded growth enabled; backlog memory is not capped"
                        );
                    }
                }
            }
        }

        let semaphore = self.semaphore.clone();
        let mut slot = TaskSlot {
            outstanding: self.outstanding.clone(),
            active_tasks: self.active_tasks.clone(),
            permit: None,
        };
        let pool = self.config.name.clone();

        tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(permit) => slot.activate(permit),
                Err(_) => {
                    warn!(pool = %pool, "Pool closed before queued task could start");
                    return;
                }
            }
            task.await;
            drop(slot);
        });

        Ok(())
    }

    /// Stop accepting new work; queued and active tasks still run
    pub fn drain(&self) {
        info!(pool = %self.config.name, "Draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Stop accepting work and drop tasks that have not started yet
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let queued = self.queued_tasks();
        if queued > 0 {
            warn!(pool = %self.config.name, queued = queued, "Shutting down pool with queued tasks");
        } else {
            info!(pool = %self.config.name, "Shutting down pool");
        }
        self.semaphore.close();
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> u32 {
        self.outstanding
            .load(Ordering::SeqCst)
            .saturating_sub(self.active_tasks())
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            name: self.config.name.clone(),
            max_concurrency: self.config.max_concurrency,
            active_tasks: self.active_tasks(),
            queued_tasks: self.queued_tasks(),
            max_queue: self.config.max_queue,
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

/// A submitted task's claim on the pool. Released on drop, so a task that
/// panics or is dropped before it runs still frees its slot.
struct TaskSlot {
    outstanding: Arc<AtomicU32>,
    active_tasks: Arc<AtomicU32>,
    permit: Option<OwnedSemaphorePermit>,
}

impl TaskSlot {
    fn activate(&mut self, permit: OwnedSemaphorePermit) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        self.permit = Some(permit);
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Periodic tasks
// ============================================================================

/// Timing of a periodic task
#[derive(Debug, Clone)]
pub struct PeriodicSchedule {
    pub name: String,
    pub initial_delay: Duration,
    pub period: Duration,
    /// Allow a firing to start while the previous one is still running
    pub overlap: bool,
    /// Stop after this many firings
    pub repeat_count: Option<u64>,
}

impl PeriodicSchedule {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            initial_delay: Duration::ZERO,
            period,
            overlap: false,
            repeat_count: None,
        }
    }
}

/// Handle to a registered periodic task. Cancelled on drop.
pub struct ScheduledTask {
    name: String,
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// No further firings start. A firing already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Cancel and wait for the scheduling loop, including any running firing
    pub async fn cancel_and_wait(&self) {
        self.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_tx.send_replace(true);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Pools keyed by name, created on first use from their profile
pub struct Scheduler {
    default_profile: PoolConfig,
    profiles: Vec<PoolConfig>,
    pools: DashMap<String, Arc<ExecutorPool>>,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            default_profile: config.default_pool.clone(),
            profiles: config.pools.clone(),
            pools: DashMap::new(),
        }
    }

    pub fn default_pool(&self) -> Arc<ExecutorPool> {
        let name = self.default_profile.name.clone();
        self.pool(&name)
    }

    /// Get or create the pool called `name`. Names without a profile get the
    /// default profile's limits.
    pub fn pool(&self, name: &str) -> Arc<ExecutorPool> {
        if let Some(pool) = self.pools.get(name) {
            return pool.clone();
        }

        let profile = self
            .profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .unwrap_or_else(|| PoolConfig {
                name: name.to_string(),
                ..self.default_profile.clone()
            });

        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ExecutorPool::new(profile)))
            .clone()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|e| e.value().get_stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Register a periodic task. Every firing runs on `pool`; a rejected
    /// submission is logged and the firing skipped. Firings are serialised,
    /// each waiting for the previous one to finish, unless `schedule.overlap`
    /// is set.
    pub fn schedule_periodic<F, Fut>(
        &self,
        schedule: PeriodicSchedule,
        pool: Arc<ExecutorPool>,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let name = schedule.name.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + schedule.initial_delay;
            let mut ticker = tokio::time::interval_at(start, schedule.period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut fired: u64 = 0;

            debug!(task = %schedule.name, period_ms = schedule.period.as_millis() as u64, "Periodic task registered");

            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_rx.changed() => break,
                }

                fired += 1;
                if schedule.overlap {
                    if let Err(e) = pool.submit(task()).await {
                        warn!(task = %schedule.name, error = %e, "Periodic firing rejected");
                    }
                } else {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    let firing = task();
                    let submitted = pool
                        .submit(async move {
                            firing.await;
                            let _ = done_tx.send(());
                        })
                        .await;
                    match submitted {
                        Ok(()) => {
                            // Closed unsent if the pool dropped the firing unrun
                            let _ = done_rx.await;
                        }
                        Err(e) => warn!(task = %schedule.name, error = %e, "Periodic firing rejected"),
                    }
                }

                if schedule.repeat_count.is_some_and(|max| fired >= max) {
                    debug!(task = %schedule.name, fired = fired, "Periodic task reached repeat count");
                    break;
                }
            }

            debug!(task = %schedule.name, "Periodic task finished");
        });

        ScheduledTask {
            name,
            cancel_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop every pool accepting new work
    pub fn drain(&self) {
        for entry in self.pools.iter() {
            entry.value().drain();
        }
    }

    pub fn all_pools_drained(&self) -> bool {
        self.pools.iter().all(|entry| entry.value().is_fully_drained())
    }

    /// Shut every pool down
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown();
        }
    }
}
