//! Switchyard demo runner
//!
//! Starts an engine context with the built-in components and a small set of
//! routes, then runs until Ctrl+C or SIGTERM and shuts down gracefully.
//!
//! Routes:
//! - `heartbeat`: a timer publishes an order to the in-memory `orders` queue
//! - `orders`: consumes the queue with visibility extension, routes by priority,
//!   redelivers failures and dead-letters what still fails
//! - `audit`: logs everything handed to `direct:audit`

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use sy_common::{properties, EngineConfig, EngineError};
use sy_engine::{
    expression, header_equals, EngineContext, ErrorHandlerDefinition, RedeliveryPolicy, RouteBuilder, StepBuilder,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ORDERS_URI: &str = "queue:orders?visibilityTimeout=30&extendMessageVisibility=true&maxMessagesPerPoll=5";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Switchyard route engine");

    let config = EngineConfig::from_env();
    info!(
        grace_period_ms = config.shutdown_grace_period.as_millis() as u64,
        max_concurrency = config.default_pool.max_concurrency,
        max_queue = config.default_pool.max_queue,
        rejection = ?config.default_pool.rejection,
        "Engine configuration loaded"
    );

    let context = EngineContext::with_default_components(config);
    context.set_default_error_handler(
        ErrorHandlerDefinition::dead_letter_channel("log:dead-letters?level=warn&showHeaders=true")
            .redelivery(RedeliveryPolicy::exponential(
                3,
                Duration::from_millis(200),
                2.0,
                Duration::from_secs(5),
            )),
    );

    add_demo_routes(&context).await?;
    context.start().await?;

    info!(routes = ?context.route_ids(), "Switchyard started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    context.stop().await;
    info!("Switchyard shutdown complete");
    Ok(())
}

async fn add_demo_routes(context: &EngineContext) -> Result<()> {
    context
        .add_route(
            RouteBuilder::from("timer:heartbeat?period=5000&delay=1000")
                .route_id("heartbeat")
                .set_body(expression(|ex| {
                    let n = ex.property(properties::TIMER_COUNTER).and_then(|v| v.as_u64()).unwrap_or(0);
                    json!({ "order": n, "amount": n * 10 })
                }))
                .set_header(
                    "priority",
                    expression(|ex| {
                        let n = ex.property(properties::TIMER_COUNTER).and_then(|v| v.as_u64()).unwrap_or(0);
                        json!(if n % 3 == 0 { "high" } else { "normal" })
                    }),
                )
                .to(ORDERS_URI)
                .build(),
        )
        .await?;

    context
        .add_route(
            RouteBuilder::from(ORDERS_URI)
                .route_id("orders")
                .log("Order received: ${body}")
                .choice(|c| {
                    c.when(header_equals("priority", "high"), |s| {
                        s.set_header("handled-by", sy_engine::constant("express")).to("direct:audit")
                    })
                    .otherwise(|s| s.to("direct:audit"))
                })
                .process_fn(|ex| {
                    // Every seventh order fails to exercise redelivery
                    let order = ex.body().get("order").and_then(|v| v.as_u64()).unwrap_or(0);
                    if order > 0 && order % 7 == 0 {
                        return Err(EngineError::processing(format!("order {} rejected by ledger", order)));
                    }
                    Ok(())
                })
                .build(),
        )
        .await?;

    context
        .add_route(
            RouteBuilder::from("direct:audit")
                .route_id("audit")
                .to("log:audit?showHeaders=true")
                .build(),
        )
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
