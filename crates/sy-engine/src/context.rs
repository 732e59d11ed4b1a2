//! EngineContext - owns the registry, scheduler and routes
//!
//! Routes start in the order they were added. Stopping suspends every route
//! first, drains them all against one grace deadline and only then unbinds the
//! consumers, so routes calling each other through `direct:` can finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sy_common::{EngineConfig, EngineError, PoolStats, Result};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::builder::{compile_route, ErrorHandlerDefinition, RouteDefinition};
use crate::component::{
    Component, DirectComponent, Endpoint, LogComponent, MockComponent, MockEndpoint, QueueComponent, TimerComponent,
};
use crate::lifecycle::LifecycleManager;
use crate::registry::EndpointRegistry;
use crate::route::{wait_for_drain, InFlightExchangeInfo, Route, RouteState, DRAIN_POLL_INTERVAL, FORCE_UNWIND_TIMEOUT};
use crate::scheduler::Scheduler;
use crate::template::ProducerTemplate;

pub struct EngineContext {
    config: EngineConfig,
    registry: Arc<EndpointRegistry>,
    scheduler: Arc<Scheduler>,

    routes: DashMap<String, Arc<Route>>,

    /// Route ids in insertion order
    route_order: RwLock<Vec<String>>,

    default_error_handler: RwLock<Option<ErrorHandlerDefinition>>,

    running: AtomicBool,

    /// For generated route ids
    route_counter: AtomicU64,

    lifecycle: Mutex<Option<LifecycleManager>>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(EndpointRegistry::new()),
            scheduler: Arc::new(Scheduler::new(&config)),
            routes: DashMap::new(),
            route_order: RwLock::new(Vec::new()),
            default_error_handler: RwLock::new(None),
            running: AtomicBool::new(false),
            route_counter: AtomicU64::new(0),
            lifecycle: Mutex::new(None),
            config,
        })
    }

    /// A context with the built-in `direct`, `timer`, `mock`, `queue` and
    /// `log` components registered
    pub fn with_default_components(config: EngineConfig) -> Arc<Self> {
        let context = Self::new(config);
        context.add_component(Arc::new(DirectComponent::new()));
        context.add_component(Arc::new(TimerComponent));
        context.add_component(Arc::new(MockComponent));
        context.add_component(Arc::new(QueueComponent::new()));
        context.add_component(Arc::new(LogComponent));
        context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn add_component(&self, component: Arc<dyn Component>) {
        self.registry.add_component(component);
    }

    /// Error handler for routes that do not define their own
    pub fn set_default_error_handler(&self, definition: ErrorHandlerDefinition) {
        *self.default_error_handler.write() = Some(definition);
    }

    /// Compile and register a route. Endpoints are resolved now, so a bad URI
    /// fails here. The route starts immediately if the context is running.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<String> {
        let id = match &definition.id {
            Some(id) => id.clone(),
            None => format!("route{}", self.route_counter.fetch_add(1, Ordering::SeqCst) + 1),
        };
        let default_handler = self.default_error_handler.read().clone();
        let (endpoint, graph) = compile_route(&definition, &self.registry, default_handler.as_ref())?;

        let pool = definition
            .pool
            .clone()
            .unwrap_or_else(|| self.config.default_pool.name.clone());
        let route = Arc::new(
            Route::new(id.clone(), endpoint, graph, pool, self.config.shutdown_grace_period)
                .with_auto_startup(definition.auto_startup),
        );

        match self.routes.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::configuration(format!("route id '{}' is already in use", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(route.clone());
            }
        }
        self.route_order.write().push(id.clone());
        info!(route_id = %id, from = %route.endpoint_uri(), "Route added");

        if self.is_running() && route.auto_startup() {
            route.start(&self.scheduler).await?;
        }
        Ok(id)
    }

    /// Start every auto-startup route, then the housekeeping tasks. If any
    /// route fails to start, routes already started are stopped again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let routes = self.routes_in_order();
        info!(routes = routes.len(), "Starting engine context");

        let mut started: Vec<Arc<Route>> = Vec::new();
        for route in routes.into_iter().filter(|r| r.auto_startup()) {
            if let Err(e) = route.start(&self.scheduler).await {
                error!(route_id = %route.id(), error = %e, "Engine start failed, stopping started routes");
                for started_route in started.iter().rev() {
                    if let Err(stop_err) = started_route.stop().await {
                        warn!(route_id = %started_route.id(), error = %stop_err, "Failed to stop route");
                    }
                }
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            started.push(route);
        }

        *self.lifecycle.lock() = Some(LifecycleManager::start(self.clone(), self.config.lifecycle.clone()));
        info!("Engine context started");
        Ok(())
    }

    /// Suspend every route, wait for in-flight exchanges across all of them
    /// within one grace period, interrupt what is left, then unbind consumers
    /// in reverse order and shut the pools down. The context cannot be
    /// restarted afterwards.
    pub async fn stop(&self) {
        info!("Engine context shutting down...");
        self.running.store(false, Ordering::SeqCst);

        let lifecycle = self.lifecycle.lock().take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown();
        }

        let routes: Vec<Arc<Route>> = self.routes_in_order().into_iter().rev().collect();
        for route in &routes {
            route.suspend().await;
        }
        self.scheduler.drain();

        let grace_period = self.config.shutdown_grace_period;
        if !self.wait_until_drained(&routes, grace_period).await {
            warn!(
                remaining = self.in_flight_count(),
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period elapsed, interrupting in-flight exchanges"
            );
            for route in &routes {
                route.interrupt();
            }
            if !self.wait_until_drained(&routes, FORCE_UNWIND_TIMEOUT).await {
                error!(remaining = self.in_flight_count(), "In-flight exchanges did not unwind");
            }
        }

        for route in &routes {
            route.finish_stop().await;
        }

        self.scheduler.shutdown();
        self.registry.shutdown();
        info!("Engine context shutdown complete");
    }

    /// Routes idle and pools empty, or false once `timeout` passes
    async fn wait_until_drained(&self, routes: &[Arc<Route>], timeout: Duration) -> bool {
        let refs: Vec<&Route> = routes.iter().map(|r| r.as_ref()).collect();
        let start = Instant::now();
        if !wait_for_drain(&refs, timeout).await {
            return false;
        }
        while !self.scheduler.all_pools_drained() {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }

    pub async fn start_route(&self, route_id: &str) -> Result<()> {
        self.route_or_err(route_id)?.start(&self.scheduler).await
    }

    pub async fn stop_route(&self, route_id: &str) -> Result<()> {
        self.route_or_err(route_id)?.stop().await
    }

    /// Stop and forget a route
    pub async fn remove_route(&self, route_id: &str) -> Result<()> {
        let route = self.route_or_err(route_id)?;
        route.stop().await?;
        self.routes.remove(route_id);
        self.route_order.write().retain(|id| id != route_id);
        info!(route_id = %route_id, "Route removed");
        Ok(())
    }

    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).map(|r| r.clone())
    }

    pub fn route_state(&self, route_id: &str) -> Option<RouteState> {
        self.route(route_id).map(|r| r.state())
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.route_order.read().clone()
    }

    pub fn producer_template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.registry.clone())
    }

    /// Resolve an endpoint and downcast it to its concrete type
    pub fn endpoint<T: Endpoint>(&self, uri: &str) -> Result<Arc<T>> {
        self.registry.resolve(uri)?.into_any().downcast::<T>().map_err(|_| {
            EngineError::configuration(format!("endpoint {} is not a {}", uri, std::any::type_name::<T>()))
        })
    }

    pub fn mock_endpoint(&self, uri: &str) -> Result<Arc<MockEndpoint>> {
        self.endpoint::<MockEndpoint>(uri)
    }

    pub fn in_flight_count(&self) -> usize {
        self.routes.iter().map(|r| r.value().in_flight_count()).sum()
    }

    /// In-flight exchanges across all routes, oldest first
    pub fn in_flight_exchanges(&self, limit: usize) -> Vec<InFlightExchangeInfo> {
        let mut exchanges: Vec<InFlightExchangeInfo> = self
            .routes
            .iter()
            .flat_map(|r| r.value().in_flight_exchanges())
            .collect();
        exchanges.sort_by(|a, b| b.elapsed_time_ms.cmp(&a.elapsed_time_ms));
        exchanges.truncate(limit);
        exchanges
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.scheduler.pool_stats()
    }

    fn routes_in_order(&self) -> Vec<Arc<Route>> {
        self.route_order
            .read()
            .iter()
            .filter_map(|id| self.route(id))
            .collect()
    }

    fn route_or_err(&self, route_id: &str) -> Result<Arc<Route>> {
        self.route(route_id)
            .ok_or_else(|| EngineError::configuration(format!("no route with id '{}'", route_id)))
    }
}
