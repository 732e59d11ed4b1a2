//! Producer calls and content enrichment
//!
//! Enrich and poll-enrich fetch a resource on an isolated sub-exchange and
//! merge it into the parent with an [`AggregationStrategy`]. What happens when
//! the fetch fails or returns nothing is an explicit [`EnrichFailure`] choice
//! on every step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{properties, EngineError, Exchange, ExchangePattern, Result};
use tracing::{debug, warn};

use super::Processor;
use crate::aggregation::AggregationStrategy;
use crate::component::{PollingConsumer, Producer};

/// What an enrich step does when its resource fetch fails or yields nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichFailure {
    /// Fail the parent exchange with the fetch failure, or `Timeout` when a
    /// poll yields nothing in time
    Propagate,
    /// Skip the merge and leave the parent as if the fetch never ran
    Ignore,
}

async fn call_producer(
    producer: &dyn Producer,
    uri: &str,
    exchange: &mut Exchange,
    timeout: Option<Duration>,
) -> Result<()> {
    match timeout {
        None => producer.process(exchange).await,
        Some(after) => match tokio::time::timeout(after, producer.process(exchange)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!("request to {}", uri), after)),
        },
    }
}

// ============================================================================
// SendTo
// ============================================================================

/// Hands the exchange to an endpoint's producer
pub struct SendTo {
    uri: String,
    producer: Arc<dyn Producer>,
    timeout: Option<Duration>,
}

impl SendTo {
    pub fn new(uri: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        Self {
            uri: uri.into(),
            producer,
            timeout: None,
        }
    }

    /// Fail with `Timeout` when the producer has not completed in time
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Processor for SendTo {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.set_property(properties::TO_ENDPOINT, self.uri.clone());
        call_producer(self.producer.as_ref(), &self.uri, exchange, self.timeout).await
    }
}

// ============================================================================
// Enricher
// ============================================================================

/// Request-response call on a sub-exchange, merged into the parent
pub struct Enricher {
    uri: String,
    producer: Arc<dyn Producer>,
    strategy: Arc<dyn AggregationStrategy>,
    on_failure: EnrichFailure,
    timeout: Option<Duration>,
}

impl Enricher {
    pub fn new(
        uri: impl Into<String>,
        producer: Arc<dyn Producer>,
        strategy: Arc<dyn AggregationStrategy>,
        on_failure: EnrichFailure,
    ) -> Self {
        Self {
            uri: uri.into(),
            producer,
            strategy,
            on_failure,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Processor for Enricher {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let mut resource = exchange.sub_exchange();
        resource.set_pattern(ExchangePattern::InOut);

        if let Err(e) = call_producer(self.producer.as_ref(), &self.uri, &mut resource, self.timeout).await {
            resource.set_failure(e);
        }

        if let Some(failure) = resource.failure().cloned() {
            resource.done();
            return skip_or_fail(exchange, &self.uri, failure, self.on_failure);
        }

        resource.handover_completions(exchange);
        self.strategy.aggregate(exchange, resource)
    }
}

// ============================================================================
// PollEnricher
// ============================================================================

/// Pulls one exchange from a polling consumer and merges it into the parent
pub struct PollEnricher {
    uri: String,
    consumer: Arc<dyn PollingConsumer>,
    strategy: Arc<dyn AggregationStrategy>,
    on_failure: EnrichFailure,
    /// `None` waits indefinitely
    timeout: Option<Duration>,
}

impl PollEnricher {
    pub fn new(
        uri: impl Into<String>,
        consumer: Arc<dyn PollingConsumer>,
        strategy: Arc<dyn AggregationStrategy>,
        on_failure: EnrichFailure,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            uri: uri.into(),
            consumer,
            strategy,
            on_failure,
            timeout,
        }
    }
}

#[async_trait]
impl Processor for PollEnricher {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let polled = match self.consumer.receive(self.timeout).await {
            Ok(polled) => polled,
            Err(e) => return skip_or_fail(exchange, &self.uri, e, self.on_failure),
        };

        let Some(mut resource) = polled else {
            let waited = self.timeout.unwrap_or_default();
            return match self.on_failure {
                EnrichFailure::Ignore => {
                    debug!(
                        exchange_id = %exchange.id(),
                        uri = %self.uri,
                        timeout_ms = waited.as_millis() as u64,
                        "Poll-enrich received nothing, merge skipped"
                    );
                    Ok(())
                }
                EnrichFailure::Propagate => {
                    exchange.set_failure(EngineError::timeout(format!("poll-enrich from {}", self.uri), waited));
                    Ok(())
                }
            };
        };

        if let Some(failure) = resource.failure().cloned() {
            resource.done();
            return skip_or_fail(exchange, &self.uri, failure, self.on_failure);
        }

        resource.handover_completions(exchange);
        self.strategy.aggregate(exchange, resource)
    }
}

fn skip_or_fail(exchange: &mut Exchange, uri: &str, failure: EngineError, on_failure: EnrichFailure) -> Result<()> {
    match on_failure {
        EnrichFailure::Propagate => {
            exchange.set_failure(failure);
        }
        EnrichFailure::Ignore => {
            warn!(
                exchange_id = %exchange.id(),
                uri = %uri,
                error = %failure,
                "Enrichment failed, merge skipped"
            );
        }
    }
    Ok(())
}
