//! Error handler and redelivery policy
//!
//! An [`ErrorHandler`] wraps a scope of the processor graph. When the scope
//! leaves the exchange failed, the handler either redelivers (rewinds the
//! messages, properties and flags captured on scope entry, settles completion
//! work the failed attempt left behind, waits out the backoff on a timer and
//! runs the scope again) or, once the budget is spent, dead-letters or
//! propagates the last failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sy_common::{headers, properties, EngineError, ErrorKind, Exchange, Result};
use tracing::{debug, error, warn};

use crate::component::Producer;
use crate::processor::{run, Processor};

// ============================================================================
// Redelivery policy
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Every redelivery waits `initial_delay`
    Fixed,
    /// Redelivery `n` waits `min(initial_delay * multiplier^n, max_delay)`
    Exponential { multiplier: f64, max_delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub initial_delay: Duration,
    pub backoff: Backoff,
    /// Failure kinds eligible for redelivery. Configuration errors are never
    /// redelivered regardless.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            initial_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            retry_on: vec![ErrorKind::Processing, ErrorKind::Timeout, ErrorKind::NoConsumers],
        }
    }
}

impl RedeliveryPolicy {
    pub fn fixed(maximum_redeliveries: u32, delay: Duration) -> Self {
        Self {
            maximum_redeliveries,
            initial_delay: delay,
            ..Self::default()
        }
    }

    pub fn exponential(maximum_redeliveries: u32, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            maximum_redeliveries,
            initial_delay,
            backoff: Backoff::Exponential { multiplier, max_delay },
            ..Self::default()
        }
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Delay before redelivery `n` (0-based)
    pub fn delay_for(&self, n: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential { multiplier, max_delay } => {
                let secs = self.initial_delay.as_secs_f64() * multiplier.powi(n.min(i32::MAX as u32) as i32);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }

    pub fn is_eligible(&self, failure: &EngineError) -> bool {
        !failure.is_configuration() && self.retry_on.contains(&failure.kind())
    }
}

// ============================================================================
// Error handler
// ============================================================================

/// Endpoint receiving exchanges whose redelivery budget is spent
pub struct DeadLetterChannel {
    uri: String,
    producer: Arc<dyn Producer>,
}

impl DeadLetterChannel {
    pub fn new(uri: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        Self { uri: uri.into(), producer }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

pub struct ErrorHandler {
    scope: Arc<dyn Processor>,
    policy: RedeliveryPolicy,
    dead_letter: Option<DeadLetterChannel>,
}

impl ErrorHandler {
    /// Exhausted failures propagate to the caller
    pub fn new(scope: Arc<dyn Processor>, policy: RedeliveryPolicy) -> Self {
        Self {
            scope,
            policy,
            dead_letter: None,
        }
    }

    /// Exhausted failures are handed to `channel`
    pub fn with_dead_letter(mut self, channel: DeadLetterChannel) -> Self {
        self.dead_letter = Some(channel);
        self
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    async fn dead_letter(&self, channel: &DeadLetterChannel, exchange: &mut Exchange, failure: EngineError, attempts: u32) {
        exchange.take_failure();
        exchange.set_property(properties::EXCEPTION_CAUGHT, failure.to_string());
        exchange.set_property(properties::FAILURE_ENDPOINT, channel.uri.clone());

        if let Err(e) = channel.producer.process(exchange).await {
            exchange.set_failure(e);
        }

        if let Some(dlc_failure) = exchange.failure() {
            error!(
                exchange_id = %exchange.id(),
                dead_letter = %channel.uri,
                error = %dlc_failure,
                original_error = %failure,
                "Dead letter channel failed"
            );
            return;
        }

        counter!("sy_dead_letters_total").increment(1);
        warn!(
            exchange_id = %exchange.id(),
            dead_letter = %channel.uri,
            attempts = attempts,
            error = %failure,
            "Exchange moved to dead letter channel"
        );
        exchange.set_property(properties::FAILURE_HANDLED, true);
        exchange.stop_routing();
    }
}

#[async_trait]
impl Processor for ErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let entry_state = exchange.snapshot();
        let mut redeliveries: u32 = 0;

        loop {
            run(self.scope.as_ref(), exchange).await;

            let Some(failure) = exchange.failure().cloned() else {
                return Ok(());
            };

            if redeliveries < self.policy.maximum_redeliveries && self.policy.is_eligible(&failure) {
                let delay = self.policy.delay_for(redeliveries);
                redeliveries += 1;
                counter!("sy_redeliveries_total").increment(1);
                debug!(
                    exchange_id = %exchange.id(),
                    attempt = redeliveries,
                    max_redeliveries = self.policy.maximum_redeliveries,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Redelivering exchange"
                );

                exchange.restore(&entry_state);
                tokio::time::sleep(delay).await;

                exchange.take_failure();
                let message = exchange.message_mut();
                message.set_header(headers::REDELIVERED, true);
                message.set_header(headers::REDELIVERY_COUNTER, redeliveries);
                message.set_header(headers::REDELIVERY_MAX_COUNTER, self.policy.maximum_redeliveries);
                continue;
            }

            let attempts = redeliveries + 1;
            match &self.dead_letter {
                Some(channel) => self.dead_letter(channel, exchange, failure, attempts).await,
                None => {
                    debug!(
                        exchange_id = %exchange.id(),
                        attempts = attempts,
                        error = %failure,
                        "Redelivery exhausted, propagating failure"
                    );
                }
            }
            return Ok(());
        }
    }
}
