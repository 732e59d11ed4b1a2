//! Processor graph
//!
//! Every node implements [`Processor`]. A node reports failure either by
//! returning `Err` or by leaving a failure cause on the exchange; enclosing
//! nodes treat both the same way (see [`run`]).

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, Result};
use tracing::debug;

pub mod enrich;
pub mod routing;
pub mod steps;

pub use enrich::{EnrichFailure, Enricher, PollEnricher, SendTo};
pub use routing::{Choice, Filter, Multicast};
pub use steps::{
    ConvertBodyToString, Delay, LogStep, MarkRollbackOnly, RollbackStep, SetBody, SetHeader, StopStep, Throttle,
};

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;
}

/// Run a processor, recording a returned error as the exchange's failure cause
pub async fn run(processor: &dyn Processor, exchange: &mut Exchange) {
    if let Err(e) = processor.process(exchange).await {
        exchange.set_failure(e);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Runs stages strictly in order. A failed stage ends the pipeline, as does
/// an exchange whose routing was stopped.
pub struct Pipeline {
    stages: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Processor>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                exchange.promote_out();
            }

            run(stage.as_ref(), exchange).await;

            if exchange.is_failed() {
                debug!(
                    exchange_id = %exchange.id(),
                    stage = index,
                    skipped = self.stages.len() - index - 1,
                    "Stage failed, skipping remaining stages"
                );
                break;
            }
            if exchange.is_routing_stopped() {
                break;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Closure processors
// ============================================================================

pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        (self.f)(exchange)
    }
}

/// Wrap a synchronous closure as a processor
pub fn process_fn<F>(f: F) -> Arc<dyn Processor>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor { f })
}
