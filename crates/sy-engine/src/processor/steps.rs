//! Small single-purpose steps

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde_json::Value;
use sy_common::{EngineError, Exchange, Result};
use tracing::{debug, info};

use super::Processor;
use crate::expression::{interpolate, Expression};

pub struct SetHeader {
    name: String,
    value: Expression,
}

impl SetHeader {
    pub fn new(name: impl Into<String>, value: Expression) -> Self {
        Self { name: name.into(), value }
    }
}

#[async_trait]
impl Processor for SetHeader {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let value = (self.value)(&*exchange);
        exchange.message_mut().set_header(self.name.clone(), value);
        Ok(())
    }
}

pub struct SetBody {
    value: Expression,
}

impl SetBody {
    pub fn new(value: Expression) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Processor for SetBody {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let value = (self.value)(&*exchange);
        exchange.set_body(value);
        Ok(())
    }
}

/// Replace the body with its text rendering
pub struct ConvertBodyToString;

#[async_trait]
impl Processor for ConvertBodyToString {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let text = exchange.message().body_as_string();
        exchange.set_body(Value::String(text));
        Ok(())
    }
}

/// Log a `${...}` template at INFO
pub struct LogStep {
    template: String,
}

impl LogStep {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }
}

#[async_trait]
impl Processor for LogStep {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let line = interpolate(&self.template, exchange);
        info!(
            route_id = %exchange.route_id().unwrap_or_default(),
            exchange_id = %exchange.id(),
            "{}",
            line
        );
        Ok(())
    }
}

/// Waits on a timer; the worker is free meanwhile
pub struct Delay {
    duration: Duration,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Processor for Delay {
    async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Limits how many exchanges per second pass this point
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl Throttle {
    pub fn per_second(max: u32) -> Result<Self> {
        let max = NonZeroU32::new(max)
            .ok_or_else(|| EngineError::configuration("throttle rate must be at least 1 per second"))?;
        Ok(Self {
            limiter: RateLimiter::direct(Quota::per_second(max)),
        })
    }
}

#[async_trait]
impl Processor for Throttle {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if self.limiter.check().is_err() {
            debug!(exchange_id = %exchange.id(), "Throttled, waiting for capacity");
            self.limiter.until_ready().await;
        }
        Ok(())
    }
}

/// Fail the exchange with `Rollback` and mark it rollback-only
pub struct RollbackStep {
    message: String,
}

impl RollbackStep {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl Processor for RollbackStep {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.set_rollback_only();
        Err(EngineError::rollback(self.message.clone()))
    }
}

/// Mark the exchange rollback-only and end routing without failing it
pub struct MarkRollbackOnly;

#[async_trait]
impl Processor for MarkRollbackOnly {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.set_rollback_only();
        exchange.stop_routing();
        Ok(())
    }
}

/// End routing successfully
pub struct StopStep;

#[async_trait]
impl Processor for StopStep {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.stop_routing();
        Ok(())
    }
}
