//! `mock:name` - records what it receives, for tests

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sy_common::{EngineError, Exchange, Result};
use tokio::sync::Notify;
use tracing::debug;

use super::{Component, Endpoint, Producer};
use crate::binder::Parameters;
use crate::processor::Processor;

pub struct MockComponent;

impl Component for MockComponent {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn create_endpoint(&self, uri: &str, remaining: &str, _params: &mut Parameters) -> Result<Arc<dyn Endpoint>> {
        if remaining.is_empty() {
            return Err(EngineError::configuration(format!("{}: mock name is mandatory", uri)));
        }
        Ok(Arc::new(MockEndpoint {
            uri: uri.to_string(),
            shared: Arc::new(MockShared::default()),
        }))
    }
}

#[derive(Default)]
struct MockState {
    received: Vec<Exchange>,
    expected_count: Option<usize>,
    expected_bodies: Option<Vec<Value>>,
    hook: Option<Arc<dyn Processor>>,
}

#[derive(Default)]
struct MockShared {
    state: Mutex<MockState>,
    received: Notify,
}

pub struct MockEndpoint {
    uri: String,
    shared: Arc<MockShared>,
}

impl MockEndpoint {
    pub fn expected_message_count(&self, count: usize) {
        self.shared.state.lock().expected_count = Some(count);
    }

    /// Expect exactly these bodies, in order
    pub fn expected_bodies_received<I, V>(&self, bodies: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.shared.state.lock().expected_bodies = Some(bodies.into_iter().map(Into::into).collect());
    }

    /// Run `processor` on every exchange before it is recorded. Its result is
    /// what the sender sees.
    pub fn when_any_exchange_received(&self, processor: Arc<dyn Processor>) {
        self.shared.state.lock().hook = Some(processor);
    }

    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.shared.state.lock().received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.shared.state.lock().received.len()
    }

    pub fn received_bodies(&self) -> Vec<Value> {
        self.shared
            .state
            .lock()
            .received
            .iter()
            .map(|ex| ex.message().body.clone())
            .collect()
    }

    /// Forget received exchanges and expectations
    pub fn reset(&self) {
        *self.shared.state.lock() = MockState::default();
    }

    /// Wait until at least `count` exchanges arrived. False on timeout.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.received.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.received_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Check expectations, waiting up to `timeout` for enough exchanges.
    /// An unmet expectation is a processing error naming the endpoint.
    pub async fn assert_is_satisfied(&self, timeout: Duration) -> Result<()> {
        let (expected_count, expected_bodies) = {
            let state = self.shared.state.lock();
            (state.expected_count, state.expected_bodies.clone())
        };
        let wanted = expected_count
            .into_iter()
            .chain(expected_bodies.as_ref().map(|b| b.len()))
            .max()
            .unwrap_or(0);
        self.wait_for_count(wanted, timeout).await;

        let received = self.received_count();
        if let Some(count) = expected_count {
            if received != count {
                return Err(EngineError::processing(format!(
                    "{}: expected {} messages but received {}",
                    self.uri, count, received
                )));
            }
        }
        if let Some(bodies) = expected_bodies {
            let actual = self.received_bodies();
            if actual != bodies {
                return Err(EngineError::processing(format!(
                    "{}: expected bodies {:?} but received {:?}",
                    self.uri, bodies, actual
                )));
            }
        }
        Ok(())
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(MockProducer {
            uri: self.uri.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct MockProducer {
    uri: String,
    shared: Arc<MockShared>,
}

#[async_trait]
impl Producer for MockProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let hook = self.shared.state.lock().hook.clone();
        let result = match hook {
            Some(hook) => hook.process(exchange).await,
            None => Ok(()),
        };

        let count = {
            let mut state = self.shared.state.lock();
            state.received.push(exchange.clone());
            state.received.len()
        };
        self.shared.received.notify_waiters();
        debug!(uri = %self.uri, exchange_id = %exchange.id(), count = count, "Mock received exchange");
        result
    }
}
