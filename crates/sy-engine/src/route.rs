//! Route - one consumer endpoint bound to a processor graph
//!
//! The route owns the consumer's lifecycle and tracks every exchange between
//! the consumer handing it over and its terminal state. Stopping runs in three
//! phases so the context can drain several routes against one deadline:
//! `suspend` turns away new exchanges, the caller waits for in-flight ones,
//! `interrupt` fails what is left with `ShutdownInterrupted`, and
//! `finish_stop` unbinds the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use sy_common::{properties, EngineError, Exchange, ExchangePattern, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::component::{Consumer, ConsumerContext, Endpoint};
use crate::processor::{run, Processor};
use crate::scheduler::Scheduler;

/// How long interrupted exchanges get to unwind after a forced stop
pub(crate) const FORCE_UNWIND_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

struct InFlightExchange {
    exchange_id: String,
    route_id: String,
    started_at: Instant,
}

/// In-flight exchange snapshot for inspection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightExchangeInfo {
    pub exchange_id: String,
    pub route_id: String,
    pub elapsed_time_ms: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// State shared between the route and the processor its consumer calls
struct RouteShared {
    route_id: String,
    graph: Arc<dyn Processor>,
    /// Admits new exchanges
    accepting: AtomicBool,
    /// Stopping but still admits calls made by exchanges already in flight
    /// elsewhere, e.g. through `direct:`
    draining: AtomicBool,
    in_flight: DashMap<String, InFlightExchange>,
    force_tx: watch::Sender<bool>,
}

/// Untracks an exchange when processing ends, including when the caller
/// drops the processing future
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, InFlightExchange>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// The processor handed to the route's consumer
struct RouteEntry {
    shared: Arc<RouteShared>,
}

#[async_trait]
impl Processor for RouteEntry {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let shared = &self.shared;
        let key = exchange.id().to_string();

        // Registered before the admission check so a concurrent stop either
        // sees this exchange or rejects it
        shared.in_flight.insert(
            key.clone(),
            InFlightExchange {
                exchange_id: key.clone(),
                route_id: shared.route_id.clone(),
                started_at: Instant::now(),
            },
        );
        let _tracked = InFlightGuard {
            in_flight: &shared.in_flight,
            key,
        };
        let nested = exchange.route_id().is_some();
        let admitted = shared.accepting.load(Ordering::SeqCst) || (nested && shared.draining.load(Ordering::SeqCst));
        if !admitted {
            return Err(EngineError::rejected(
                format!("route {}", shared.route_id),
                "route is not accepting exchanges",
            ));
        }

        // The route where an exchange starts owns its completion
        let owner = !nested;
        if owner {
            exchange.set_route_id(shared.route_id.clone());
        }
        counter!("sy_exchanges_total", "route" => shared.route_id.clone()).increment(1);

        let mut force_rx = shared.force_tx.subscribe();
        let already_forced = *force_rx.borrow_and_update();
        let interrupted = if already_forced {
            true
        } else {
            tokio::select! {
                _ = run(shared.graph.as_ref(), exchange) => false,
                _ = force_rx.changed() => true,
            }
        };

        if interrupted {
            warn!(
                route_id = %shared.route_id,
                exchange_id = %exchange.id(),
                "Exchange interrupted by route shutdown"
            );
            exchange.set_failure(EngineError::ShutdownInterrupted {
                route_id: shared.route_id.clone(),
            });
        }

        if let Some(failure) = exchange.failure() {
            counter!("sy_exchanges_failed_total", "route" => shared.route_id.clone()).increment(1);
            let handled = exchange.property(properties::FAILURE_HANDLED).is_some();
            if owner && !handled && exchange.pattern() == ExchangePattern::InOnly {
                error!(
                    route_id = %shared.route_id,
                    exchange_id = %exchange.id(),
                    error = %failure,
                    "Exchange failed"
                );
            } else {
                debug!(
                    route_id = %shared.route_id,
                    exchange_id = %exchange.id(),
                    error = %failure,
                    "Exchange failed, surfaced to caller"
                );
            }
        }

        if owner {
            exchange.done();
        }
        Ok(())
    }
}

pub struct Route {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    pool_name: String,
    grace_period: Duration,
    auto_startup: bool,
    shared: Arc<RouteShared>,
    state: Mutex<RouteState>,
    /// Serialises start and stop
    consumer: tokio::sync::Mutex<Option<Arc<dyn Consumer>>>,
}

impl Route {
    pub fn new(
        id: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
        graph: Arc<dyn Processor>,
        pool_name: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        let id = id.into();
        let (force_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(RouteShared {
                route_id: id.clone(),
                graph,
                accepting: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                in_flight: DashMap::new(),
                force_tx,
            }),
            id,
            endpoint,
            pool_name: pool_name.into(),
            grace_period,
            auto_startup: true,
            state: Mutex::new(RouteState::Stopped),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint_uri(&self) -> &str {
        self.endpoint.uri()
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn auto_startup(&self) -> bool {
        self.auto_startup
    }

    pub fn state(&self) -> RouteState {
        *self.state.lock()
    }

    fn set_state(&self, state: RouteState) {
        *self.state.lock() = state;
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Oldest first
    pub fn in_flight_exchanges(&self) -> Vec<InFlightExchangeInfo> {
        let mut exchanges: Vec<InFlightExchangeInfo> = self
            .shared
            .in_flight
            .iter()
            .map(|entry| {
                let elapsed = entry.value().started_at.elapsed();
                InFlightExchangeInfo {
                    exchange_id: entry.value().exchange_id.clone(),
                    route_id: entry.value().route_id.clone(),
                    elapsed_time_ms: elapsed.as_millis() as u64,
                    started_at: chrono::Utc::now()
                        - chrono::Duration::milliseconds(elapsed.as_millis() as i64),
                }
            })
            .collect();

        exchanges.sort_by(|a, b| b.elapsed_time_ms.cmp(&a.elapsed_time_ms));
        exchanges
    }

    /// Create and start the consumer. A failure leaves the route stopped with
    /// nothing bound.
    pub async fn start(&self, scheduler: &Arc<Scheduler>) -> Result<()> {
        let mut slot = self.consumer.lock().await;
        match self.state() {
            RouteState::Started => return Ok(()),
            RouteState::Stopping => {
                return Err(EngineError::configuration(format!("route {} is stopping", self.id)));
            }
            _ => {}
        }

        self.set_state(RouteState::Starting);
        self.shared.force_tx.send_replace(false);
        self.shared.accepting.store(true, Ordering::SeqCst);

        let ctx = ConsumerContext {
            route_id: self.id.clone(),
            scheduler: scheduler.clone(),
            pool: scheduler.pool(&self.pool_name),
        };
        let entry: Arc<dyn Processor> = Arc::new(RouteEntry {
            shared: self.shared.clone(),
        });

        let consumer = match self.endpoint.create_consumer(entry, ctx) {
            Ok(consumer) => consumer,
            Err(e) => return Err(self.fail_start(e)),
        };
        if let Err(e) = consumer.start().await {
            if let Err(stop_err) = consumer.stop().await {
                warn!(route_id = %self.id, error = %stop_err, "Failed to unbind consumer after failed start");
            }
            return Err(self.fail_start(e));
        }

        *slot = Some(consumer);
        self.set_state(RouteState::Started);
        info!(route_id = %self.id, from = %self.endpoint.uri(), "Route started");
        Ok(())
    }

    fn fail_start(&self, e: EngineError) -> EngineError {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.set_state(RouteState::Stopped);
        error!(route_id = %self.id, from = %self.endpoint.uri(), error = %e, "Route failed to start");
        e
    }

    /// Stop the consumer, then drain in-flight exchanges within the grace period
    pub async fn stop(&self) -> Result<()> {
        if self.state() == RouteState::Stopped {
            return Ok(());
        }

        self.suspend().await;
        if !wait_for_drain(&[self], self.grace_period).await {
            warn!(
                route_id = %self.id,
                remaining = self.in_flight_count(),
                grace_period_ms = self.grace_period.as_millis() as u64,
                "Grace period elapsed, interrupting in-flight exchanges"
            );
            self.interrupt();
            if !wait_for_drain(&[self], FORCE_UNWIND_TIMEOUT).await {
                error!(route_id = %self.id, remaining = self.in_flight_count(), "In-flight exchanges did not unwind");
            }
        }

        self.finish_stop().await;
        Ok(())
    }

    /// Turn away new exchanges and suspend the consumer. Exchanges already in
    /// flight, and the calls they make into this route, carry on.
    pub async fn suspend(&self) {
        let slot = self.consumer.lock().await;
        if self.state() != RouteState::Started {
            return;
        }

        self.set_state(RouteState::Stopping);
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.accepting.store(false, Ordering::SeqCst);
        info!(route_id = %self.id, in_flight = self.in_flight_count(), "Stopping route");

        if let Some(consumer) = slot.as_ref() {
            if let Err(e) = consumer.suspend().await {
                warn!(route_id = %self.id, error = %e, "Consumer failed to suspend cleanly");
            }
        }
    }

    /// Fail every exchange still in flight with `ShutdownInterrupted`
    pub fn interrupt(&self) {
        self.shared.force_tx.send_replace(true);
    }

    /// Unbind the consumer. Nothing is admitted afterwards.
    pub async fn finish_stop(&self) {
        let mut slot = self.consumer.lock().await;
        if self.state() == RouteState::Stopped {
            return;
        }

        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.draining.store(false, Ordering::SeqCst);
        if let Some(consumer) = slot.take() {
            if let Err(e) = consumer.stop().await {
                warn!(route_id = %self.id, error = %e, "Consumer failed to stop cleanly");
            }
        }

        self.set_state(RouteState::Stopped);
        info!(route_id = %self.id, "Route stopped");
    }

    fn is_drained(&self) -> bool {
        self.shared.in_flight.is_empty()
    }
}

/// Wait until none of `routes` has an exchange in flight. False on timeout.
pub(crate) async fn wait_for_drain(routes: &[&Route], timeout: Duration) -> bool {
    let start = Instant::now();
    while !routes.iter().all(|r| r.is_drained()) {
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::process_fn;
    use std::any::Any;
    use sy_common::EngineConfig;

    /// Endpoint whose consumer hands its processor to the test
    struct Manual {
        processor: Arc<Mutex<Option<Arc<dyn Processor>>>>,
        fail_start: bool,
    }

    struct ManualConsumer {
        fail_start: bool,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Consumer for ManualConsumer {
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(EngineError::configuration("bind failed"));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Endpoint for Manual {
        fn uri(&self) -> &str {
            "manual://test"
        }

        fn create_consumer(&self, processor: Arc<dyn Processor>, _ctx: ConsumerContext) -> Result<Arc<dyn Consumer>> {
            *self.processor.lock() = Some(processor);
            Ok(Arc::new(ManualConsumer {
                fail_start: self.fail_start,
                stopped: Arc::new(AtomicBool::new(false)),
            }))
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl Processor for Sleep {
        async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn route(graph: Arc<dyn Processor>, grace: Duration) -> (Route, Arc<Mutex<Option<Arc<dyn Processor>>>>) {
        let slot = Arc::new(Mutex::new(None));
        let endpoint = Arc::new(Manual {
            processor: slot.clone(),
            fail_start: false,
        });
        (Route::new("r1", endpoint, graph, "default", grace), slot)
    }

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(&EngineConfig::default()))
    }

    fn entry(slot: &Arc<Mutex<Option<Arc<dyn Processor>>>>) -> Arc<dyn Processor> {
        slot.lock().clone().expect("consumer created")
    }

    #[tokio::test]
    async fn test_state_transitions_and_completion() {
        let (route, slot) = route(process_fn(|_| Ok(())), Duration::from_secs(1));
        assert_eq!(route.state(), RouteState::Stopped);

        route.start(&scheduler()).await.unwrap();
        assert_eq!(route.state(), RouteState::Started);

        let completed = Arc::new(AtomicBool::new(false));
        let mut exchange = Exchange::in_only("x");
        {
            let completed = completed.clone();
            exchange.add_on_completion(move |_| completed.store(true, Ordering::SeqCst));
        }
        entry(&slot).process(&mut exchange).await.unwrap();
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(exchange.route_id(), Some("r1"));

        route.stop().await.unwrap();
        assert_eq!(route.state(), RouteState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let endpoint = Arc::new(Manual {
            processor: Arc::new(Mutex::new(None)),
            fail_start: true,
        });
        let route = Route::new("r1", endpoint, process_fn(|_| Ok(())), "default", Duration::from_secs(1));
        assert!(route.start(&scheduler()).await.is_err());
        assert_eq!(route.state(), RouteState::Stopped);
    }

    #[tokio::test]
    async fn test_late_arrival_is_rejected() {
        let (route, slot) = route(process_fn(|_| Ok(())), Duration::from_millis(50));
        route.start(&scheduler()).await.unwrap();
        route.stop().await.unwrap();

        let mut exchange = Exchange::in_only("late");
        let err = entry(&slot).process(&mut exchange).await.unwrap_err();
        assert!(matches!(err, EngineError::RejectedExecution { .. }));
    }

    #[tokio::test]
    async fn test_suspended_route_admits_only_nested_calls() {
        let (route, slot) = route(process_fn(|_| Ok(())), Duration::from_secs(1));
        route.start(&scheduler()).await.unwrap();
        route.suspend().await;
        assert_eq!(route.state(), RouteState::Stopping);
        assert!(route.start(&scheduler()).await.is_err());

        let mut fresh = Exchange::in_only("new");
        let err = entry(&slot).process(&mut fresh).await.unwrap_err();
        assert!(matches!(err, EngineError::RejectedExecution { .. }));

        let mut nested = Exchange::in_only("from upstream");
        nested.set_route_id("upstream");
        entry(&slot).process(&mut nested).await.unwrap();
        assert!(!nested.is_failed());

        route.finish_stop().await;
        assert_eq!(route.state(), RouteState::Stopped);
        let mut late = Exchange::in_only("late");
        late.set_route_id("upstream");
        assert!(entry(&slot).process(&mut late).await.is_err());
    }

    #[tokio::test]
    async fn test_in_flight_completes_within_grace() {
        let (route, slot) = route(Arc::new(Sleep(Duration::from_millis(100))), Duration::from_secs(2));
        route.start(&scheduler()).await.unwrap();

        let processor = entry(&slot);
        let in_flight = tokio::spawn(async move {
            let mut exchange = Exchange::in_only("slow");
            processor.process(&mut exchange).await.unwrap();
            exchange
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(route.in_flight_count(), 1);
        assert_eq!(route.in_flight_exchanges()[0].route_id, "r1");

        route.stop().await.unwrap();
        let exchange = in_flight.await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(route.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_grace_period_expiry_interrupts() {
        let (route, slot) = route(Arc::new(Sleep(Duration::from_secs(30))), Duration::from_millis(100));
        route.start(&scheduler()).await.unwrap();

        let processor = entry(&slot);
        let in_flight = tokio::spawn(async move {
            let mut exchange = Exchange::in_only("stuck");
            processor.process(&mut exchange).await.unwrap();
            exchange
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        route.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let exchange = in_flight.await.unwrap();
        assert!(matches!(exchange.failure(), Some(EngineError::ShutdownInterrupted { .. })));
    }
}
