// ============================================================================
// Configuration Types
// ============================================================================

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;

pub const DEFAULT_POOL_NAME: &str = "default";

/// What an executor pool does when its pending queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicy {
    /// Fail the submission with `RejectedExecution`
    Reject,
    /// Run the task on the submitting task
    CallerRuns,
    /// Keep queueing without bound. Memory use grows with the backlog.
    Grow,
}

impl FromStr for RejectionPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" | "abort" => Ok(Self::Reject),
            "caller-runs" | "callerruns" => Ok(Self::CallerRuns),
            "grow" | "unbounded" => Ok(Self::Grow),
            other => Err(EngineError::configuration(format!(
                "unknown rejection policy '{}'",
                other
            ))),
        }
    }
}

/// Executor pool profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Tasks allowed to run at once
    pub max_concurrency: u32,
    /// Tasks allowed to wait for a slot
    pub max_queue: u32,
    pub rejection: RejectionPolicy,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            max_queue: max_concurrency.saturating_mul(10).max(100),
            rejection: RejectionPolicy::Reject,
        }
    }

    pub fn with_max_queue(mut self, max_queue: u32) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn with_rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.rejection = rejection;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_NAME, 20)
    }
}

/// Statistics for an executor pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub max_concurrency: u32,
    pub active_tasks: u32,
    pub queued_tasks: u32,
    pub max_queue: u32,
    pub rejected_total: u64,
    pub running: bool,
}

/// Intervals for the engine's background housekeeping tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How often in-flight exchanges are checked for slowness
    pub slow_exchange_check_interval: Duration,
    /// In-flight exchanges older than this are reported as slow
    pub slow_exchange_threshold: Duration,
    /// Interval for the pool and route stats report
    pub stats_report_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            slow_exchange_check_interval: Duration::from_secs(30),
            slow_exchange_threshold: Duration::from_secs(60),
            stats_report_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a stopping route waits for in-flight exchanges
    pub shutdown_grace_period: Duration,
    pub default_pool: PoolConfig,
    /// Additional named pool profiles, e.g. dedicated per-route pools
    pub pools: Vec<PoolConfig>,
    pub lifecycle: LifecycleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(30),
            default_pool: PoolConfig::default(),
            pools: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SWITCHYARD_*` environment variables,
    /// keeping defaults for anything missing or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("SWITCHYARD_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace_period = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("SWITCHYARD_POOL_MAX_CONCURRENCY") {
            config.default_pool.max_concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("SWITCHYARD_POOL_MAX_QUEUE") {
            config.default_pool.max_queue = n;
        }
        if let Ok(raw) = std::env::var("SWITCHYARD_POOL_REJECTION") {
            match raw.parse::<RejectionPolicy>() {
                Ok(policy) => config.default_pool.rejection = policy,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring SWITCHYARD_POOL_REJECTION"),
            }
        }
        if let Some(ms) = env_parse::<u64>("SWITCHYARD_SLOW_EXCHANGE_MS") {
            config.lifecycle.slow_exchange_threshold = Duration::from_millis(ms);
        }

        config
    }

    /// Look up a pool profile by name, including the default profile
    pub fn pool_profile(&self, name: &str) -> Option<&PoolConfig> {
        if self.default_pool.name == name {
            return Some(&self.default_pool);
        }
        self.pools.iter().find(|p| p.name == name)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
