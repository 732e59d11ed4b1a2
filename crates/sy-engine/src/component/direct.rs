//! `direct:name` - synchronous in-process call into another route
//!
//! The producer runs the consuming route's processor on the caller's task, so
//! the caller sees the route's failure and reply on the same exchange.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sy_common::{EngineError, Exchange, Result};
use tracing::{debug, warn};

use super::{Component, Consumer, ConsumerContext, Endpoint, Producer};
use crate::binder::Parameters;
use crate::processor::Processor;

type ConsumerMap = Arc<DashMap<String, Arc<dyn Processor>>>;

/// Consumers are shared by every endpoint this component creates
#[derive(Default)]
pub struct DirectComponent {
    consumers: ConsumerMap,
}

impl DirectComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names that currently have a consumer bound
    pub fn bound_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.consumers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Component for DirectComponent {
    fn scheme(&self) -> &str {
        "direct"
    }

    fn create_endpoint(&self, uri: &str, remaining: &str, params: &mut Parameters) -> Result<Arc<dyn Endpoint>> {
        if remaining.is_empty() {
            return Err(EngineError::configuration(format!("{}: direct endpoint name is mandatory", uri)));
        }
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            name: remaining.to_string(),
            fail_if_no_consumers: params.take_bool("failIfNoConsumers", true)?,
            consumers: self.consumers.clone(),
        }))
    }
}

pub struct DirectEndpoint {
    uri: String,
    name: String,
    fail_if_no_consumers: bool,
    consumers: ConsumerMap,
}

impl DirectEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>, ctx: ConsumerContext) -> Result<Arc<dyn Consumer>> {
        Ok(Arc::new(DirectConsumer {
            uri: self.uri.clone(),
            name: self.name.clone(),
            route_id: ctx.route_id,
            processor,
            consumers: self.consumers.clone(),
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(DirectProducer {
            uri: self.uri.clone(),
            name: self.name.clone(),
            fail_if_no_consumers: self.fail_if_no_consumers,
            consumers: self.consumers.clone(),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct DirectConsumer {
    uri: String,
    name: String,
    route_id: String,
    processor: Arc<dyn Processor>,
    consumers: ConsumerMap,
}

impl DirectConsumer {
    fn is_bound_here(&self, bound: &Arc<dyn Processor>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(bound), Arc::as_ptr(&self.processor))
    }
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn start(&self) -> Result<()> {
        match self.consumers.entry(self.name.clone()) {
            Entry::Occupied(existing) if !self.is_bound_here(existing.get()) => Err(EngineError::configuration(
                format!("{}: a consumer is already bound to this endpoint", self.uri),
            )),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(self.processor.clone());
                debug!(name = %self.name, route_id = %self.route_id, "Direct consumer bound");
                Ok(())
            }
        }
    }

    /// Stays bound so in-flight exchanges of calling routes can finish. The
    /// route itself turns away new callers.
    async fn suspend(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self
            .consumers
            .remove_if(&self.name, |_, bound| self.is_bound_here(bound))
            .is_some()
        {
            debug!(name = %self.name, route_id = %self.route_id, "Direct consumer unbound");
        }
        Ok(())
    }
}

struct DirectProducer {
    uri: String,
    name: String,
    fail_if_no_consumers: bool,
    consumers: ConsumerMap,
}

#[async_trait]
impl Producer for DirectProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        // Cloned out so the map is not locked while the route runs
        let processor = self.consumers.get(&self.name).map(|p| p.clone());
        match processor {
            Some(processor) => processor.process(exchange).await,
            None if self.fail_if_no_consumers => Err(EngineError::NoConsumers { uri: self.uri.clone() }),
            None => {
                warn!(uri = %self.uri, exchange_id = %exchange.id(), "No consumers available, exchange dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::process_fn;
    use crate::scheduler::Scheduler;
    use serde_json::json;
    use std::collections::BTreeMap;
    use sy_common::EngineConfig;

    fn ctx() -> ConsumerContext {
        let scheduler = Arc::new(Scheduler::new(&EngineConfig::default()));
        ConsumerContext {
            route_id: "r1".to_string(),
            pool: scheduler.default_pool(),
            scheduler,
        }
    }

    fn endpoint(component: &DirectComponent, query: &[(&str, &str)]) -> Arc<dyn Endpoint> {
        let params: BTreeMap<String, String> = query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut params = Parameters::new(params);
        let endpoint = component.create_endpoint("direct://a", "a", &mut params).unwrap();
        assert!(params.is_empty());
        endpoint
    }

    #[tokio::test]
    async fn test_producer_calls_bound_consumer() {
        let component = DirectComponent::new();
        let endpoint = endpoint(&component, &[]);

        let consumer = endpoint
            .create_consumer(
                process_fn(|ex| {
                    ex.set_body(json!("handled"));
                    Ok(())
                }),
                ctx(),
            )
            .unwrap();
        consumer.start().await.unwrap();
        assert_eq!(component.bound_names(), vec!["a".to_string()]);

        let mut exchange = Exchange::in_only("x");
        endpoint.create_producer().unwrap().process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body(), &json!("handled"));

        consumer.suspend().await.unwrap();
        assert_eq!(component.bound_names(), vec!["a".to_string()]);

        consumer.stop().await.unwrap();
        assert!(component.bound_names().is_empty());
    }

    #[tokio::test]
    async fn test_no_consumers() {
        let component = DirectComponent::new();
        let mut exchange = Exchange::in_only("x");

        let strict = endpoint(&component, &[]);
        let err = strict.create_producer().unwrap().process(&mut exchange).await.unwrap_err();
        assert!(matches!(err, EngineError::NoConsumers { .. }));

        let lenient = endpoint(&component, &[("failIfNoConsumers", "false")]);
        assert!(lenient.create_producer().unwrap().process(&mut exchange).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_consumer_rejected() {
        let component = DirectComponent::new();
        let endpoint = endpoint(&component, &[]);

        let first = endpoint.create_consumer(process_fn(|_| Ok(())), ctx()).unwrap();
        let second = endpoint.create_consumer(process_fn(|_| Ok(())), ctx()).unwrap();
        first.start().await.unwrap();

        let err = second.start().await.unwrap_err();
        assert!(err.is_configuration());

        // Stopping the rejected consumer must not unbind the first one
        second.stop().await.unwrap();
        assert_eq!(component.bound_names(), vec!["a".to_string()]);
    }
}
