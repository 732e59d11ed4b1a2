//! ProducerTemplate - send exchanges to endpoints from application code

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sy_common::{EngineError, Exchange, ExchangePattern, Message, Result};

use crate::component::Producer;
use crate::registry::EndpointRegistry;

pub struct ProducerTemplate {
    registry: Arc<EndpointRegistry>,
    producers: DashMap<String, Arc<dyn Producer>>,
}

impl ProducerTemplate {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            producers: DashMap::new(),
        }
    }

    fn producer(&self, uri: &str) -> Result<Arc<dyn Producer>> {
        let endpoint = self.registry.resolve(uri)?;
        if let Some(producer) = self.producers.get(endpoint.uri()) {
            return Ok(producer.clone());
        }
        let producer = endpoint.create_producer()?;
        Ok(self
            .producers
            .entry(endpoint.uri().to_string())
            .or_insert(producer)
            .clone())
    }

    /// Send an exchange and return it at its terminal state. A failure is
    /// left on the returned exchange.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Exchange {
        match self.producer(uri) {
            Ok(producer) => {
                if let Err(e) = producer.process(&mut exchange).await {
                    exchange.set_failure(e);
                }
            }
            Err(e) => exchange.set_failure(e),
        }
        exchange.done();
        exchange
    }

    pub async fn send_body(&self, uri: &str, body: impl Into<Value>) -> Result<()> {
        self.send(uri, Exchange::in_only(body)).await.into_result().map(|_| ())
    }

    pub async fn send_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Value>,
        header: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<()> {
        let message = Message::new(body).with_header(header, value);
        let exchange = Exchange::with_message(ExchangePattern::InOnly, message);
        self.send(uri, exchange).await.into_result().map(|_| ())
    }

    /// Request-response: the reply body, or the final failure cause
    pub async fn request_body(&self, uri: &str, body: impl Into<Value>) -> Result<Value> {
        let exchange = self.send(uri, Exchange::in_out(body)).await.into_result()?;
        Ok(exchange.body().clone())
    }

    /// Request-response that gives up with `Timeout` after `timeout`
    pub async fn request_body_with_timeout(
        &self,
        uri: &str,
        body: impl Into<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.request_body(uri, body)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!("request to {}", uri), timeout)),
        }
    }

    /// Request-response returning the whole exchange
    pub async fn request(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange> {
        exchange.set_pattern(ExchangePattern::InOut);
        self.send(uri, exchange).await.into_result()
    }
}
