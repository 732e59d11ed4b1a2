//! Route definitions and the fluent builder
//!
//! ```ignore
//! let route = RouteBuilder::from("timer:tick?period=1000")
//!     .route_id("ticker")
//!     .poll_enrich("queue:inbox", Some(Duration::from_secs(5)), EnrichFailure::Ignore)
//!     .log("Polled ${body}")
//!     .to("mock:result")
//!     .build();
//! ```
//!
//! Definitions are plain data until [`compile_route`] resolves every endpoint
//! against the registry, so a bad URI fails when the route is added.

use std::sync::Arc;
use std::time::Duration;

use sy_common::{EngineError, Exchange, Result};

use crate::aggregation::{AggregationStrategy, ReplaceMessage, UseLatest};
use crate::component::Endpoint;
use crate::error_handler::{DeadLetterChannel, ErrorHandler, RedeliveryPolicy};
use crate::expression::{Expression, Predicate};
use crate::processor::{
    process_fn, Choice, ConvertBodyToString, Delay, EnrichFailure, Enricher, Filter, LogStep, MarkRollbackOnly,
    Multicast, Pipeline, PollEnricher, Processor, RollbackStep, SendTo, SetBody, SetHeader, StopStep, Throttle,
};
use crate::registry::EndpointRegistry;
use crate::transaction::{Transacted, TransactionManager};

// ============================================================================
// Definitions
// ============================================================================

#[derive(Clone)]
pub enum StepDefinition {
    To {
        uri: String,
        timeout: Option<Duration>,
    },
    Process(Arc<dyn Processor>),
    SetHeader {
        name: String,
        value: Expression,
    },
    SetBody(Expression),
    ConvertBodyToString,
    Log(String),
    Delay(Duration),
    Throttle(u32),
    Filter {
        predicate: Predicate,
        steps: Vec<StepDefinition>,
    },
    Choice {
        whens: Vec<(Predicate, Vec<StepDefinition>)>,
        otherwise: Option<Vec<StepDefinition>>,
    },
    Multicast {
        branches: Vec<Vec<StepDefinition>>,
        parallel: bool,
        stop_on_exception: bool,
        strategy: Option<Arc<dyn AggregationStrategy>>,
    },
    Enrich {
        uri: String,
        strategy: Option<Arc<dyn AggregationStrategy>>,
        on_failure: EnrichFailure,
        timeout: Option<Duration>,
    },
    PollEnrich {
        uri: String,
        timeout: Option<Duration>,
        strategy: Option<Arc<dyn AggregationStrategy>>,
        on_failure: EnrichFailure,
    },
    Transacted {
        manager: Arc<dyn TransactionManager>,
        steps: Vec<StepDefinition>,
    },
    ErrorHandler {
        definition: ErrorHandlerDefinition,
        steps: Vec<StepDefinition>,
    },
    Rollback(String),
    MarkRollbackOnly,
    Stop,
}

/// Redelivery policy plus what happens on exhaustion
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorHandlerDefinition {
    pub policy: RedeliveryPolicy,
    /// Exhausted exchanges go here; `None` propagates the failure
    pub dead_letter_uri: Option<String>,
}

impl ErrorHandlerDefinition {
    /// No redelivery; failures propagate
    pub fn default_handler() -> Self {
        Self {
            policy: RedeliveryPolicy::default(),
            dead_letter_uri: None,
        }
    }

    pub fn dead_letter_channel(uri: impl Into<String>) -> Self {
        Self {
            policy: RedeliveryPolicy::default(),
            dead_letter_uri: Some(uri.into()),
        }
    }

    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Clone)]
pub struct RouteDefinition {
    pub id: Option<String>,
    pub from: String,
    pub steps: Vec<StepDefinition>,
    /// Falls back to the context's default error handler
    pub error_handler: Option<ErrorHandlerDefinition>,
    /// Executor pool for the route's consumer; the default pool when unset
    pub pool: Option<String>,
    pub auto_startup: bool,
}

// ============================================================================
// Builders
// ============================================================================

/// Fluent step methods shared by route builders and nested scopes
pub trait StepBuilder: Sized {
    fn step(self, step: StepDefinition) -> Self;

    fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::To {
            uri: uri.into(),
            timeout: None,
        })
    }

    /// Request-response call failing with `Timeout` after `timeout`
    fn to_with_timeout(self, uri: impl Into<String>, timeout: Duration) -> Self {
        self.step(StepDefinition::To {
            uri: uri.into(),
            timeout: Some(timeout),
        })
    }

    fn process(self, processor: Arc<dyn Processor>) -> Self {
        self.step(StepDefinition::Process(processor))
    }

    fn process_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
    {
        self.step(StepDefinition::Process(process_fn(f)))
    }

    fn set_header(self, name: impl Into<String>, value: Expression) -> Self {
        self.step(StepDefinition::SetHeader {
            name: name.into(),
            value,
        })
    }

    fn set_body(self, value: Expression) -> Self {
        self.step(StepDefinition::SetBody(value))
    }

    fn convert_body_to_string(self) -> Self {
        self.step(StepDefinition::ConvertBodyToString)
    }

    fn log(self, template: impl Into<String>) -> Self {
        self.step(StepDefinition::Log(template.into()))
    }

    fn delay(self, duration: Duration) -> Self {
        self.step(StepDefinition::Delay(duration))
    }

    fn throttle(self, per_second: u32) -> Self {
        self.step(StepDefinition::Throttle(per_second))
    }

    fn filter(self, predicate: Predicate, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.step(StepDefinition::Filter {
            predicate,
            steps: scope(Steps::new()).into_steps(),
        })
    }

    fn choice(self, choice: impl FnOnce(ChoiceBuilder) -> ChoiceBuilder) -> Self {
        let built = choice(ChoiceBuilder::default());
        self.step(StepDefinition::Choice {
            whens: built.whens,
            otherwise: built.otherwise,
        })
    }

    fn multicast(self, multicast: impl FnOnce(MulticastBuilder) -> MulticastBuilder) -> Self {
        let built = multicast(MulticastBuilder::default());
        self.step(StepDefinition::Multicast {
            branches: built.branches,
            parallel: built.parallel,
            stop_on_exception: built.stop_on_exception,
            strategy: built.strategy,
        })
    }

    fn enrich(self, uri: impl Into<String>, on_failure: EnrichFailure) -> Self {
        self.step(StepDefinition::Enrich {
            uri: uri.into(),
            strategy: None,
            on_failure,
            timeout: None,
        })
    }

    fn enrich_with(
        self,
        uri: impl Into<String>,
        strategy: Arc<dyn AggregationStrategy>,
        on_failure: EnrichFailure,
    ) -> Self {
        self.step(StepDefinition::Enrich {
            uri: uri.into(),
            strategy: Some(strategy),
            on_failure,
            timeout: None,
        })
    }

    /// `timeout` of `None` waits indefinitely for a resource
    fn poll_enrich(self, uri: impl Into<String>, timeout: Option<Duration>, on_failure: EnrichFailure) -> Self {
        self.step(StepDefinition::PollEnrich {
            uri: uri.into(),
            timeout,
            strategy: None,
            on_failure,
        })
    }

    fn poll_enrich_with(
        self,
        uri: impl Into<String>,
        timeout: Option<Duration>,
        strategy: Arc<dyn AggregationStrategy>,
        on_failure: EnrichFailure,
    ) -> Self {
        self.step(StepDefinition::PollEnrich {
            uri: uri.into(),
            timeout,
            strategy: Some(strategy),
            on_failure,
        })
    }

    fn transacted(self, manager: Arc<dyn TransactionManager>, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.step(StepDefinition::Transacted {
            manager,
            steps: scope(Steps::new()).into_steps(),
        })
    }

    /// Error handler scoped to the given steps
    fn error_handler(self, definition: ErrorHandlerDefinition, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.step(StepDefinition::ErrorHandler {
            definition,
            steps: scope(Steps::new()).into_steps(),
        })
    }

    fn rollback(self, message: impl Into<String>) -> Self {
        self.step(StepDefinition::Rollback(message.into()))
    }

    fn mark_rollback_only(self) -> Self {
        self.step(StepDefinition::MarkRollbackOnly)
    }

    fn stop(self) -> Self {
        self.step(StepDefinition::Stop)
    }
}

/// A nested sequence of steps
#[derive(Clone, Default)]
pub struct Steps {
    steps: Vec<StepDefinition>,
}

impl Steps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_steps(self) -> Vec<StepDefinition> {
        self.steps
    }
}

impl StepBuilder for Steps {
    fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Default)]
pub struct ChoiceBuilder {
    whens: Vec<(Predicate, Vec<StepDefinition>)>,
    otherwise: Option<Vec<StepDefinition>>,
}

impl ChoiceBuilder {
    pub fn when(mut self, predicate: Predicate, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.whens.push((predicate, scope(Steps::new()).into_steps()));
        self
    }

    pub fn otherwise(mut self, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.otherwise = Some(scope(Steps::new()).into_steps());
        self
    }
}

#[derive(Default)]
pub struct MulticastBuilder {
    branches: Vec<Vec<StepDefinition>>,
    parallel: bool,
    stop_on_exception: bool,
    strategy: Option<Arc<dyn AggregationStrategy>>,
}

impl MulticastBuilder {
    pub fn branch(mut self, scope: impl FnOnce(Steps) -> Steps) -> Self {
        self.branches.push(scope(Steps::new()).into_steps());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn stop_on_exception(mut self) -> Self {
        self.stop_on_exception = true;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

pub struct RouteBuilder {
    definition: RouteDefinition,
}

impl RouteBuilder {
    #[allow(clippy::should_implement_trait)]
    pub fn from(uri: impl Into<String>) -> Self {
        Self {
            definition: RouteDefinition {
                id: None,
                from: uri.into(),
                steps: Vec::new(),
                error_handler: None,
                pool: None,
                auto_startup: true,
            },
        }
    }

    pub fn route_id(mut self, id: impl Into<String>) -> Self {
        self.definition.id = Some(id.into());
        self
    }

    /// Route-level error handler wrapping every step
    pub fn with_error_handler(mut self, definition: ErrorHandlerDefinition) -> Self {
        self.definition.error_handler = Some(definition);
        self
    }

    pub fn pool(mut self, name: impl Into<String>) -> Self {
        self.definition.pool = Some(name.into());
        self
    }

    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.definition.auto_startup = auto_startup;
        self
    }

    pub fn build(self) -> RouteDefinition {
        self.definition
    }
}

impl StepBuilder for RouteBuilder {
    fn step(mut self, step: StepDefinition) -> Self {
        self.definition.steps.push(step);
        self
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Resolve the route's consumer endpoint and build its processor graph
pub fn compile_route(
    definition: &RouteDefinition,
    registry: &EndpointRegistry,
    default_error_handler: Option<&ErrorHandlerDefinition>,
) -> Result<(Arc<dyn Endpoint>, Arc<dyn Processor>)> {
    let endpoint = registry.resolve(&definition.from)?;
    let graph = compile_steps(&definition.steps, registry)?;

    let graph = match definition.error_handler.as_ref().or(default_error_handler) {
        Some(handler) => compile_error_handler(handler, graph, registry)?,
        None => graph,
    };
    Ok((endpoint, graph))
}

pub fn compile_steps(steps: &[StepDefinition], registry: &EndpointRegistry) -> Result<Arc<dyn Processor>> {
    let mut compiled = steps
        .iter()
        .map(|step| compile_step(step, registry))
        .collect::<Result<Vec<_>>>()?;

    if compiled.len() == 1 {
        if let Some(single) = compiled.pop() {
            return Ok(single);
        }
    }
    Ok(Arc::new(Pipeline::new(compiled)))
}

fn compile_error_handler(
    definition: &ErrorHandlerDefinition,
    scope: Arc<dyn Processor>,
    registry: &EndpointRegistry,
) -> Result<Arc<dyn Processor>> {
    let mut handler = ErrorHandler::new(scope, definition.policy.clone());
    if let Some(uri) = &definition.dead_letter_uri {
        let endpoint = registry.resolve(uri)?;
        handler = handler.with_dead_letter(DeadLetterChannel::new(endpoint.uri(), endpoint.create_producer()?));
    }
    Ok(Arc::new(handler))
}

fn compile_step(step: &StepDefinition, registry: &EndpointRegistry) -> Result<Arc<dyn Processor>> {
    let processor: Arc<dyn Processor> = match step {
        StepDefinition::To { uri, timeout } => {
            let endpoint = registry.resolve(uri)?;
            Arc::new(SendTo::new(endpoint.uri(), endpoint.create_producer()?).with_timeout(*timeout))
        }
        StepDefinition::Process(processor) => processor.clone(),
        StepDefinition::SetHeader { name, value } => Arc::new(SetHeader::new(name.clone(), value.clone())),
        StepDefinition::SetBody(value) => Arc::new(SetBody::new(value.clone())),
        StepDefinition::ConvertBodyToString => Arc::new(ConvertBodyToString),
        StepDefinition::Log(template) => Arc::new(LogStep::new(template.clone())),
        StepDefinition::Delay(duration) => Arc::new(Delay::new(*duration)),
        StepDefinition::Throttle(per_second) => Arc::new(Throttle::per_second(*per_second)?),
        StepDefinition::Filter { predicate, steps } => {
            Arc::new(Filter::new(predicate.clone(), compile_steps(steps, registry)?))
        }
        StepDefinition::Choice { whens, otherwise } => {
            if whens.is_empty() {
                return Err(EngineError::configuration("choice needs at least one when clause"));
            }
            let whens = whens
                .iter()
                .map(|(predicate, steps)| Ok((predicate.clone(), compile_steps(steps, registry)?)))
                .collect::<Result<Vec<_>>>()?;
            let otherwise = otherwise
                .as_ref()
                .map(|steps| compile_steps(steps, registry))
                .transpose()?;
            Arc::new(Choice::new(whens, otherwise))
        }
        StepDefinition::Multicast {
            branches,
            parallel,
            stop_on_exception,
            strategy,
        } => {
            let branches = branches
                .iter()
                .map(|steps| compile_steps(steps, registry))
                .collect::<Result<Vec<_>>>()?;
            let strategy = strategy.clone().unwrap_or_else(|| Arc::new(UseLatest));
            Arc::new(
                Multicast::new(branches)
                    .parallel(*parallel)
                    .stop_on_exception(*stop_on_exception)
                    .strategy(strategy),
            )
        }
        StepDefinition::Enrich {
            uri,
            strategy,
            on_failure,
            timeout,
        } => {
            let endpoint = registry.resolve(uri)?;
            let strategy = strategy.clone().unwrap_or_else(|| Arc::new(ReplaceMessage));
            Arc::new(
                Enricher::new(endpoint.uri(), endpoint.create_producer()?, strategy, *on_failure)
                    .with_timeout(*timeout),
            )
        }
        StepDefinition::PollEnrich {
            uri,
            timeout,
            strategy,
            on_failure,
        } => {
            let endpoint = registry.resolve(uri)?;
            let strategy = strategy.clone().unwrap_or_else(|| Arc::new(ReplaceMessage));
            Arc::new(PollEnricher::new(
                endpoint.uri(),
                endpoint.create_polling_consumer()?,
                strategy,
                *on_failure,
                *timeout,
            ))
        }
        StepDefinition::Transacted { manager, steps } => {
            Arc::new(Transacted::new(manager.clone(), compile_steps(steps, registry)?))
        }
        StepDefinition::ErrorHandler { definition, steps } => {
            compile_error_handler(definition, compile_steps(steps, registry)?, registry)?
        }
        StepDefinition::Rollback(message) => Arc::new(RollbackStep::new(message.clone())),
        StepDefinition::MarkRollbackOnly => Arc::new(MarkRollbackOnly),
        StepDefinition::Stop => Arc::new(StopStep),
    };
    Ok(processor)
}
