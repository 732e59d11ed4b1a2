//! Filter, content-based router and multicast

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use sy_common::{EngineError, Exchange, Result};
use tracing::debug;

use super::{run, Processor};
use crate::aggregation::{AggregationStrategy, UseLatest};
use crate::expression::Predicate;

/// Runs its scope only for exchanges matching the predicate
pub struct Filter {
    predicate: Predicate,
    scope: Arc<dyn Processor>,
}

impl Filter {
    pub fn new(predicate: Predicate, scope: Arc<dyn Processor>) -> Self {
        Self { predicate, scope }
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if (self.predicate)(&*exchange) {
            self.scope.process(exchange).await
        } else {
            debug!(exchange_id = %exchange.id(), "Filter did not match");
            Ok(())
        }
    }
}

/// Content-based router: the first matching branch wins
pub struct Choice {
    whens: Vec<(Predicate, Arc<dyn Processor>)>,
    otherwise: Option<Arc<dyn Processor>>,
}

impl Choice {
    pub fn new(whens: Vec<(Predicate, Arc<dyn Processor>)>, otherwise: Option<Arc<dyn Processor>>) -> Self {
        Self { whens, otherwise }
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let branch = self
            .whens
            .iter()
            .find(|(predicate, _)| predicate(&*exchange))
            .map(|(_, branch)| branch)
            .or(self.otherwise.as_ref());

        match branch {
            Some(branch) => branch.process(exchange).await,
            None => Ok(()),
        }
    }
}

/// Sends a copy of the exchange to every branch and aggregates the results
/// back into the original.
///
/// Branch results are aggregated in branch order. When a branch fails the
/// first failure cause is set on the original after aggregation; with
/// `stop_on_exception` no further sequential branches are started.
pub struct Multicast {
    branches: Vec<Arc<dyn Processor>>,
    parallel: bool,
    stop_on_exception: bool,
    strategy: Arc<dyn AggregationStrategy>,
}

impl Multicast {
    pub fn new(branches: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            branches,
            parallel: false,
            stop_on_exception: false,
            strategy: Arc::new(UseLatest),
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    async fn run_sequential(&self, exchange: &Exchange) -> Vec<Exchange> {
        let mut results = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let mut copy = exchange.sub_exchange();
            run(branch.as_ref(), &mut copy).await;
            let failed = copy.is_failed();
            results.push(copy);
            if failed && self.stop_on_exception {
                debug!(exchange_id = %exchange.id(), "Multicast branch failed, stopping");
                break;
            }
        }
        results
    }

    async fn run_parallel(&self, exchange: &Exchange) -> Vec<Exchange> {
        let branches = self.branches.iter().map(|branch| {
            let mut copy = exchange.sub_exchange();
            async move {
                run(branch.as_ref(), &mut copy).await;
                copy
            }
        });
        join_all(branches).await
    }
}

#[async_trait]
impl Processor for Multicast {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let results = if self.parallel {
            self.run_parallel(exchange).await
        } else {
            self.run_sequential(exchange).await
        };

        let mut first_failure: Option<EngineError> = None;
        for mut result in results {
            result.handover_completions(exchange);
            match result.take_failure() {
                Some(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                None => self.strategy.aggregate(exchange, result)?,
            }
        }

        if let Some(e) = first_failure {
            exchange.set_failure(e);
        }
        Ok(())
    }
}
