//! Component plug-in contract and the built-in components
//!
//! A connector implements a small set of capability traits:
//! - [`Component`]: turns a URI into an [`Endpoint`]
//! - [`Endpoint`]: creates consumers, producers and polling consumers
//! - [`Consumer`]: binds to a trigger source and feeds exchanges to a processor
//! - [`Producer`]: accepts an exchange, populating its output when it replies
//! - [`PollingConsumer`]: hands out one exchange on demand (poll-enrich)
//!
//! The engine depends only on these traits.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{EngineError, Exchange, Result};

use crate::binder::Parameters;
use crate::processor::Processor;
use crate::scheduler::{ExecutorPool, Scheduler};

pub mod direct;
pub mod log;
pub mod mock;
pub mod queue;
pub mod timer;

pub use direct::DirectComponent;
pub use log::LogComponent;
pub use mock::{MockComponent, MockEndpoint};
pub use queue::{MemoryQueue, QueueComponent, QueueEndpoint};
pub use timer::TimerComponent;

/// Factory for endpoints of one URI scheme
pub trait Component: Send + Sync {
    fn scheme(&self) -> &str;

    /// Accept parameters the component does not consume instead of failing
    fn lenient_properties(&self) -> bool {
        false
    }

    /// Create an endpoint for `uri` (normalised). `remaining` is the
    /// component-specific path. Consume understood keys from `params`;
    /// the registry reports leftovers. Mandatory settings should be validated
    /// here so a bad URI fails at resolution rather than on first use.
    fn create_endpoint(&self, uri: &str, remaining: &str, params: &mut Parameters) -> Result<Arc<dyn Endpoint>>;
}

/// Execution context handed to a consumer when its route starts
#[derive(Clone)]
pub struct ConsumerContext {
    pub route_id: String,
    pub scheduler: Arc<Scheduler>,
    /// The pool the route's work runs on
    pub pool: Arc<ExecutorPool>,
}

pub trait Endpoint: Send + Sync + 'static {
    /// Normalised URI identifying this endpoint
    fn uri(&self) -> &str;

    fn create_consumer(&self, _processor: Arc<dyn Processor>, _ctx: ConsumerContext) -> Result<Arc<dyn Consumer>> {
        Err(unsupported(self.uri(), "consuming"))
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Err(unsupported(self.uri(), "producing"))
    }

    fn create_polling_consumer(&self) -> Result<Arc<dyn PollingConsumer>> {
        Err(unsupported(self.uri(), "polling"))
    }

    /// For downcasting to the concrete endpoint type
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Bind to the trigger source. An error fails the route start.
    async fn start(&self) -> Result<()>;

    /// Stop creating exchanges while the engine drains. In-process consumers
    /// that only relay calls from other routes stay bound until `stop`.
    async fn suspend(&self) -> Result<()> {
        self.stop().await
    }

    /// Unbind from the trigger source. No new exchanges are created afterwards.
    /// May be called after `suspend`.
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;
}

#[async_trait]
pub trait PollingConsumer: Send + Sync {
    /// `None` waits indefinitely, `Some(Duration::ZERO)` does not wait.
    /// `Ok(None)` means nothing arrived in time.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Exchange>>;
}

fn unsupported(uri: &str, capability: &str) -> EngineError {
    EngineError::configuration(format!("endpoint {} does not support {}", uri, capability))
}
