//! Switchyard route engine
//!
//! This crate provides:
//! - EndpointRegistry: URI resolution through pluggable components, one endpoint per normalised URI
//! - Processor graph: pipelines, filters, content-based routing, multicast, enrich and poll-enrich
//! - Route: consumer lifecycle, in-flight tracking and graceful shutdown
//! - Scheduler: named executor pools with rejection policies and periodic tasks
//! - ErrorHandler: redelivery with backoff and dead-letter channels
//! - EngineContext: owns routes, registry and scheduler; builds routes from definitions
//! - Built-in components: direct, timer, mock, queue, log

pub mod aggregation;
pub mod binder;
pub mod builder;
pub mod component;
pub mod context;
pub mod error_handler;
pub mod expression;
pub mod lifecycle;
pub mod processor;
pub mod registry;
pub mod route;
pub mod scheduler;
pub mod template;
pub mod transaction;
pub mod uri;

pub use aggregation::{aggregate_fn, AggregationStrategy, ReplaceBody, ReplaceMessage, UseLatest};
pub use binder::Parameters;
pub use builder::{
    ErrorHandlerDefinition, RouteBuilder, RouteDefinition, StepBuilder, StepDefinition, Steps,
};
pub use component::{Component, Consumer, ConsumerContext, Endpoint, PollingConsumer, Producer};
pub use context::EngineContext;
pub use error_handler::{Backoff, DeadLetterChannel, ErrorHandler, RedeliveryPolicy};
pub use expression::{body_equals, constant, expression, header_equals, predicate, Expression, Predicate};
pub use lifecycle::LifecycleManager;
pub use processor::{process_fn, EnrichFailure, Pipeline, Processor};
pub use registry::EndpointRegistry;
pub use route::{InFlightExchangeInfo, Route, RouteState};
pub use scheduler::{ExecutorPool, PeriodicSchedule, ScheduledTask, Scheduler};
pub use template::ProducerTemplate;
pub use transaction::{TransactionManager, Transacted};
pub use uri::EndpointUri;

pub use sy_common::{EngineConfig, EngineError, ErrorKind, Exchange, ExchangePattern, Message, Result};
