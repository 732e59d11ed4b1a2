//! `queue:name` - in-memory queue with SQS-style visibility
//!
//! A received message stays in the queue but is invisible until its
//! visibility timeout passes or it is deleted. The consumer deletes a message
//! once its exchange completes successfully; a failed message reappears when
//! its visibility lapses. With `extendMessageVisibility=true` a background
//! task pushes the timeout out every half period while the message is being
//! processed. When the route's pool turns a message away it is released at
//! once and the consumer backs off for `pollDelay`.
//!
//! Parameters:
//! - `visibilityTimeout` seconds, default 30
//! - `extendMessageVisibility` default false, needs an explicit `visibilityTimeout`
//! - `maxMessagesPerPoll` default 10
//! - `pollDelay` milliseconds to wait for messages per poll, default 500
//! - `deleteAfterRead` default true

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sy_common::{headers, EngineError, Exchange, ExchangePattern, Message, Result};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Component, Consumer, ConsumerContext, Endpoint, PollingConsumer, Producer};
use crate::binder::Parameters;
use crate::processor::Processor;

// ============================================================================
// Broker
// ============================================================================

struct StoredMessage {
    id: String,
    message: Message,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

/// A message handed out by [`MemoryQueue::receive`]
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub message: Message,
    pub receive_count: u32,
}

pub struct MemoryQueue {
    name: String,
    messages: Mutex<Vec<StoredMessage>>,
    available: Notify,
    visibility_changes: AtomicU64,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
            available: Notify::new(),
            visibility_changes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message, returning its id
    pub fn send(&self, message: Message) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.messages.lock().push(StoredMessage {
            id: id.clone(),
            message,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        self.available.notify_waiters();
        id
    }

    /// Take up to `max` visible messages, hiding each for `visibility`
    pub fn receive(&self, max: usize, visibility: Duration) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max)
            .map(|m| {
                let receipt = uuid::Uuid::new_v4().to_string();
                m.receive_count += 1;
                m.visible_at = now + visibility;
                m.receipt = Some(receipt.clone());
                ReceivedMessage {
                    message_id: m.id.clone(),
                    receipt_handle: receipt,
                    message: m.message.clone(),
                    receive_count: m.receive_count,
                }
            })
            .collect()
    }

    /// Like [`receive`](Self::receive) but waits up to `wait` for a message
    /// to become visible. `None` waits indefinitely.
    pub async fn receive_wait(&self, max: usize, visibility: Duration, wait: Option<Duration>) -> Vec<ReceivedMessage> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.receive(max, visibility);
            if !batch.is_empty() || deadline.is_some_and(|d| d <= Instant::now()) {
                return batch;
            }

            let wake_at = match (self.next_visible_at(), deadline) {
                (Some(visible), Some(deadline)) => Some(visible.min(deadline)),
                (visible, deadline) => visible.or(deadline),
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Remove a received message. False if the receipt is stale.
    pub fn delete(&self, receipt: &str) -> bool {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.receipt.as_deref() != Some(receipt));
        before != messages.len()
    }

    /// Hide a received message for `timeout` from now. Zero makes it visible
    /// immediately.
    pub fn change_visibility(&self, receipt: &str, timeout: Duration) -> bool {
        let changed = {
            let mut messages = self.messages.lock();
            match messages.iter_mut().find(|m| m.receipt.as_deref() == Some(receipt)) {
                Some(m) => {
                    m.visible_at = Instant::now() + timeout;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.visibility_changes.fetch_add(1, Ordering::SeqCst);
            if timeout.is_zero() {
                self.available.notify_waiters();
            }
        }
        changed
    }

    /// Messages in the queue, visible or not
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn visibility_change_count(&self) -> u64 {
        self.visibility_changes.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Component
// ============================================================================

/// Queues are shared by name across endpoints
#[derive(Default)]
pub struct QueueComponent {
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
}

impl QueueComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue called `name`, created if needed
    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEndpointConfig {
    pub visibility_timeout: Duration,
    pub extend_visibility: bool,
    pub max_messages_per_poll: usize,
    pub poll_delay: Duration,
    pub delete_after_read: bool,
}

impl Component for QueueComponent {
    fn scheme(&self) -> &str {
        "queue"
    }

    fn create_endpoint(&self, uri: &str, remaining: &str, params: &mut Parameters) -> Result<Arc<dyn Endpoint>> {
        if remaining.is_empty() {
            return Err(EngineError::configuration(format!("{}: queue name is mandatory", uri)));
        }

        let explicit_visibility = params.take_seconds("visibilityTimeout")?;
        let extend_visibility = params.take_bool("extendMessageVisibility", false)?;
        if extend_visibility && !explicit_visibility.is_some_and(|v| !v.is_zero()) {
            return Err(EngineError::configuration(format!(
                "{}: extendMessageVisibility requires a positive visibilityTimeout",
                uri
            )));
        }

        let config = QueueEndpointConfig {
            visibility_timeout: explicit_visibility.unwrap_or(Duration::from_secs(30)),
            extend_visibility,
            max_messages_per_poll: params.take_or("maxMessagesPerPoll", 10)?,
            poll_delay: params.take_millis("pollDelay")?.unwrap_or(Duration::from_millis(500)),
            delete_after_read: params.take_bool("deleteAfterRead", true)?,
        };
        if config.max_messages_per_poll == 0 {
            return Err(EngineError::configuration(format!("{}: maxMessagesPerPoll must be positive", uri)));
        }

        Ok(Arc::new(QueueEndpoint {
            uri: uri.to_string(),
            queue: self.queue(remaining),
            config,
        }))
    }
}

pub struct QueueEndpoint {
    uri: String,
    queue: Arc<MemoryQueue>,
    config: QueueEndpointConfig,
}

impl QueueEndpoint {
    pub fn queue(&self) -> &Arc<MemoryQueue> {
        &self.queue
    }

    pub fn config(&self) -> &QueueEndpointConfig {
        &self.config
    }
}

impl Endpoint for QueueEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>, ctx: ConsumerContext) -> Result<Arc<dyn Consumer>> {
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(QueueConsumer {
            queue: self.queue.clone(),
            config: self.config.clone(),
            processor,
            ctx,
            shutdown_tx,
            handle: Mutex::new(None),
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(QueueProducer {
            queue: self.queue.clone(),
        }))
    }

    fn create_polling_consumer(&self) -> Result<Arc<dyn PollingConsumer>> {
        Ok(Arc::new(QueuePollingConsumer {
            queue: self.queue.clone(),
            config: self.config.clone(),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Build the exchange for a received message. Completion deletes it on
/// success; on failure it is left to reappear, or made visible at once when
/// `release_on_failure` is set.
fn received_exchange(
    queue: &Arc<MemoryQueue>,
    received: ReceivedMessage,
    delete_after_read: bool,
    release_on_failure: bool,
) -> Exchange {
    let mut exchange = Exchange::with_message(ExchangePattern::InOnly, received.message);
    let message = exchange.in_message_mut();
    message.set_header(headers::QUEUE_MESSAGE_ID, received.message_id.clone());
    message.set_header(headers::QUEUE_RECEIVE_COUNT, received.receive_count);

    let queue = queue.clone();
    let receipt = received.receipt_handle;
    exchange.add_on_completion(move |ex| {
        if !ex.is_failed() {
            if delete_after_read && !queue.delete(&receipt) {
                warn!(queue = %queue.name(), exchange_id = %ex.id(), "Delete failed, receipt no longer valid");
            }
        } else if release_on_failure {
            queue.change_visibility(&receipt, Duration::ZERO);
        }
    });
    exchange
}

// ============================================================================
// Consumer
// ============================================================================

struct QueueConsumer {
    queue: Arc<MemoryQueue>,
    config: QueueEndpointConfig,
    processor: Arc<dyn Processor>,
    ctx: ConsumerContext,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Consumer for QueueConsumer {
    async fn start(&self) -> Result<()> {
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let queue = self.queue.clone();
        let config = self.config.clone();
        let processor = self.processor.clone();
        let pool = self.ctx.pool.clone();
        let route_id = self.ctx.route_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let batch = tokio::select! {
                    batch = queue.receive_wait(config.max_messages_per_poll, config.visibility_timeout, Some(config.poll_delay)) => batch,
                    _ = shutdown_rx.changed() => break,
                };

                let mut pending = batch.into_iter();
                let mut saturated = false;
                for received in pending.by_ref() {
                    let receipt = received.receipt_handle.clone();
                    let mut exchange = received_exchange(&queue, received, config.delete_after_read, false);
                    let processor = processor.clone();
                    let extender = spawn_extender(&queue, &config, receipt.clone());
                    let queue_for_task = queue.clone();
                    let route_id_for_task = route_id.clone();
                    let release = receipt.clone();

                    let job = async move {
                        let result = processor.process(&mut exchange).await;
                        drop(extender);
                        if let Err(e) = result {
                            // Not admitted by the route; hand it straight back
                            debug!(route_id = %route_id_for_task, error = %e, "Queue message not processed");
                            queue_for_task.change_visibility(&receipt, Duration::ZERO);
                        }
                    };

                    if let Err(e) = pool.submit(job).await {
                        warn!(queue = %queue.name(), route_id = %route_id, error = %e, "Failed to submit queue message");
                        queue.change_visibility(&release, Duration::ZERO);
                        saturated = true;
                        break;
                    }
                }

                if saturated {
                    for unsent in pending {
                        queue.change_visibility(&unsent.receipt_handle, Duration::ZERO);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
            debug!(queue = %queue.name(), route_id = %route_id, "Queue consumer loop finished");
        });

        info!(queue = %self.queue.name(), route_id = %self.ctx.route_id, "Queue consumer started");
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!(queue = %self.queue.name(), route_id = %self.ctx.route_id, "Queue consumer stopped");
        }
        Ok(())
    }
}

/// Pushes a message's visibility out every half period until dropped or the
/// receipt goes stale
struct Extender(JoinHandle<()>);

impl Drop for Extender {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_extender(queue: &Arc<MemoryQueue>, config: &QueueEndpointConfig, receipt: String) -> Option<Extender> {
    if !config.extend_visibility {
        return None;
    }
    let queue = queue.clone();
    let visibility = config.visibility_timeout;
    Some(Extender(tokio::spawn(async move {
        loop {
            tokio::time::sleep(visibility / 2).await;
            if !queue.change_visibility(&receipt, visibility) {
                break;
            }
            debug!(
                queue = %queue.name(),
                extension_secs = visibility.as_secs(),
                "Extended visibility for in-progress message"
            );
        }
    })))
}

// ============================================================================
// Producer and polling consumer
// ============================================================================

struct QueueProducer {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Producer for QueueProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let id = self.queue.send(exchange.message().clone());
        exchange.message_mut().set_header(headers::QUEUE_MESSAGE_ID, id);
        Ok(())
    }
}

struct QueuePollingConsumer {
    queue: Arc<MemoryQueue>,
    config: QueueEndpointConfig,
}

#[async_trait]
impl PollingConsumer for QueuePollingConsumer {
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Exchange>> {
        let received = self
            .queue
            .receive_wait(1, self.config.visibility_timeout, timeout)
            .await
            .into_iter()
            .next();
        Ok(received.map(|r| received_exchange(&self.queue, r, self.config.delete_after_read, true)))
    }
}
