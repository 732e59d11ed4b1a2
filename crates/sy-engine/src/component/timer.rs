//! `timer:name` - periodic trigger
//!
//! Parameters: `period` and `delay` in milliseconds (both default 1000),
//! `repeatCount` (0 means unlimited), `concurrentFirings` (default false).

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sy_common::{properties, EngineError, Exchange, ExchangePattern, Result};
use tracing::{debug, info};

use super::{Component, Consumer, ConsumerContext, Endpoint};
use crate::binder::Parameters;
use crate::processor::Processor;
use crate::scheduler::{PeriodicSchedule, ScheduledTask};

const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);
const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

pub struct TimerComponent;

impl Component for TimerComponent {
    fn scheme(&self) -> &str {
        "timer"
    }

    fn create_endpoint(&self, uri: &str, remaining: &str, params: &mut Parameters) -> Result<Arc<dyn Endpoint>> {
        if remaining.is_empty() {
            return Err(EngineError::configuration(format!("{}: timer name is mandatory", uri)));
        }

        let period = params.take_millis("period")?.unwrap_or(DEFAULT_PERIOD);
        if period.is_zero() {
            return Err(EngineError::configuration(format!("{}: period must be positive", uri)));
        }
        let delay = params.take_millis("delay")?.unwrap_or(DEFAULT_DELAY);
        let repeat_count = params.take_or::<u64>("repeatCount", 0)?;
        let concurrent = params.take_bool("concurrentFirings", false)?;

        Ok(Arc::new(TimerEndpoint {
            uri: uri.to_string(),
            schedule: PeriodicSchedule {
                name: remaining.to_string(),
                initial_delay: delay,
                period,
                overlap: concurrent,
                repeat_count: (repeat_count > 0).then_some(repeat_count),
            },
        }))
    }
}

pub struct TimerEndpoint {
    uri: String,
    schedule: PeriodicSchedule,
}

impl TimerEndpoint {
    pub fn schedule(&self) -> &PeriodicSchedule {
        &self.schedule
    }
}

impl Endpoint for TimerEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>, ctx: ConsumerContext) -> Result<Arc<dyn Consumer>> {
        Ok(Arc::new(TimerConsumer {
            schedule: self.schedule.clone(),
            processor,
            ctx,
            task: Mutex::new(None),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct TimerConsumer {
    schedule: PeriodicSchedule,
    processor: Arc<dyn Processor>,
    ctx: ConsumerContext,
    task: Mutex<Option<ScheduledTask>>,
}

#[async_trait]
impl Consumer for TimerConsumer {
    async fn start(&self) -> Result<()> {
        let processor = self.processor.clone();
        let name = self.schedule.name.clone();
        let counter = Arc::new(AtomicU64::new(0));
        let route_id = self.ctx.route_id.clone();

        let task = self.ctx.scheduler.schedule_periodic(self.schedule.clone(), self.ctx.pool.clone(), move || {
            let processor = processor.clone();
            let name = name.clone();
            let route_id = route_id.clone();
            let fired = counter.fetch_add(1, Ordering::SeqCst) + 1;

            async move {
                let mut exchange = Exchange::new(ExchangePattern::InOnly);
                exchange.set_property(properties::TIMER_NAME, name);
                exchange.set_property(properties::TIMER_FIRED_TIME, chrono::Utc::now().to_rfc3339());
                exchange.set_property(properties::TIMER_COUNTER, fired);

                if let Err(e) = processor.process(&mut exchange).await {
                    debug!(route_id = %route_id, error = %e, "Timer firing not accepted");
                }
            }
        });

        info!(
            timer = %self.schedule.name,
            period_ms = self.schedule.period.as_millis() as u64,
            route_id = %self.ctx.route_id,
            "Timer started"
        );
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // A firing already running is left to the route's drain
        if let Some(task) = self.task.lock().take() {
            task.cancel();
            debug!(timer = %task.name(), "Timer stopped");
        }
        Ok(())
    }
}
