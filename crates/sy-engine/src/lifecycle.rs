//! Background housekeeping for a running engine context
//!
//! - slow exchange detection
//! - periodic pool and route statistics

use std::sync::Arc;
use std::time::Duration;

use sy_common::LifecycleConfig;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::route::InFlightExchangeInfo;

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(context: Arc<EngineContext>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Slow exchange monitor
        {
            let context = context.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.slow_exchange_check_interval;
            let threshold = config.slow_exchange_threshold;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for info in slow_exchanges(&context, threshold) {
                                warn!(
                                    exchange_id = %info.exchange_id,
                                    route_id = %info.route_id,
                                    elapsed_ms = info.elapsed_time_ms,
                                    "Slow exchange detected"
                                );
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Slow exchange monitor shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Stats report
        {
            let context = context.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.stats_report_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => report_stats(&context),
                        _ = shutdown_rx.recv() => {
                            debug!("Stats reporter shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle manager started");
        Self { shutdown_tx }
    }

    /// Signal shutdown to all lifecycle tasks
    pub fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
    }
}

/// In-flight exchanges that have run for at least `threshold`
pub fn slow_exchanges(context: &EngineContext, threshold: Duration) -> Vec<InFlightExchangeInfo> {
    let threshold_ms = threshold.as_millis() as u64;
    context
        .in_flight_exchanges(usize::MAX)
        .into_iter()
        .filter(|info| info.elapsed_time_ms >= threshold_ms)
        .collect()
}

fn report_stats(context: &EngineContext) {
    for stats in context.pool_stats() {
        info!(
            pool = %stats.name,
            active = stats.active_tasks,
            queued = stats.queued_tasks,
            rejected = stats.rejected_total,
            "Pool stats"
        );
    }
    for route_id in context.route_ids() {
        if let Some(route) = context.route(&route_id) {
            info!(
                route_id = %route_id,
                state = ?route.state(),
                in_flight = route.in_flight_count(),
                "Route stats"
            );
        }
    }
}
