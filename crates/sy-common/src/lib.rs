use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
pub mod error;

pub use config::{EngineConfig, LifecycleConfig, PoolConfig, PoolStats, RejectionPolicy, DEFAULT_POOL_NAME};
pub use error::{EngineError, ErrorKind, Result};

// ============================================================================
// Well-known header and property keys
// ============================================================================

pub mod headers {
    pub const REDELIVERED: &str = "SwitchyardRedelivered";
    pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
    pub const REDELIVERY_MAX_COUNTER: &str = "SwitchyardRedeliveryMaxCounter";
    pub const QUEUE_MESSAGE_ID: &str = "SwitchyardQueueMessageId";
    pub const QUEUE_RECEIVE_COUNT: &str = "SwitchyardQueueReceiveCount";
}

pub mod properties {
    pub const EXCEPTION_CAUGHT: &str = "SwitchyardExceptionCaught";
    pub const FAILURE_HANDLED: &str = "SwitchyardFailureHandled";
    pub const FAILURE_ENDPOINT: &str = "SwitchyardFailureEndpoint";
    pub const TO_ENDPOINT: &str = "SwitchyardToEndpoint";
    pub const TIMER_NAME: &str = "SwitchyardTimerName";
    pub const TIMER_FIRED_TIME: &str = "SwitchyardTimerFiredTime";
    pub const TIMER_COUNTER: &str = "SwitchyardTimerCounter";
}

// ============================================================================
// Message
// ============================================================================

/// Body plus a flat, string-keyed header map. Header keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    pub headers: HashMap<String, Value>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) -> Option<Value> {
        self.headers.remove(key)
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Body rendered as text: strings verbatim, null as empty, anything else as JSON
    pub fn body_as_string(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Exchange
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// Fire-and-forget
    InOnly,
    /// Request-response
    InOut,
}

/// Work to run once an exchange reaches its terminal state
pub type OnCompletion = Box<dyn FnOnce(&Exchange) + Send + Sync>;

/// Routing state of an exchange at one point, see [`Exchange::snapshot`]
#[derive(Debug, Clone)]
pub struct ExchangeSnapshot {
    input: Message,
    output: Option<Message>,
    properties: HashMap<String, Value>,
    rollback_only: bool,
    routing_stopped: bool,
    completions: usize,
}

/// The unit of work flowing through a route.
///
/// At a terminal state an exchange either completed successfully or carries a
/// failure cause. When an output message is present it supersedes the input
/// for everything downstream of the stage that set it.
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    input: Message,
    output: Option<Message>,
    failure: Option<EngineError>,
    properties: HashMap<String, Value>,
    route_id: Option<String>,
    created_at: DateTime<Utc>,
    rollback_only: bool,
    routing_stopped: bool,
    completions: Vec<OnCompletion>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        Self::with_message(pattern, Message::default())
    }

    pub fn with_message(pattern: ExchangePattern, message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern,
            input: message,
            output: None,
            failure: None,
            properties: HashMap::new(),
            route_id: None,
            created_at: Utc::now(),
            rollback_only: false,
            routing_stopped: false,
            completions: Vec::new(),
        }
    }

    pub fn in_only(body: impl Into<Value>) -> Self {
        Self::with_message(ExchangePattern::InOnly, Message::new(body))
    }

    pub fn in_out(body: impl Into<Value>) -> Self {
        Self::with_message(ExchangePattern::InOut, Message::new(body))
    }

    /// An isolated copy of this exchange for a sub-fetch or a multicast branch.
    /// Gets a fresh id; the current message and properties are copied,
    /// completion work is not.
    pub fn sub_exchange(&self) -> Exchange {
        let mut sub = Exchange::with_message(self.pattern, self.message().clone());
        sub.properties = self.properties.clone();
        sub.route_id = self.route_id.clone();
        sub
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    // --- messages -----------------------------------------------------------

    pub fn in_message(&self) -> &Message {
        &self.input
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    pub fn has_out(&self) -> bool {
        self.output.is_some()
    }

    pub fn set_out(&mut self, message: Message) {
        self.output = Some(message);
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.output.take()
    }

    /// The current message: the output if one was set, otherwise the input
    pub fn message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.output {
            Some(ref mut out) => out,
            None => &mut self.input,
        }
    }

    /// Make the output, if any, the input of the next stage
    pub fn promote_out(&mut self) {
        if let Some(out) = self.output.take() {
            self.input = out;
        }
    }

    /// Capture messages, properties and flags, e.g. on entry to a scope that
    /// may have to run again
    pub fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            input: self.input.clone(),
            output: self.output.clone(),
            properties: self.properties.clone(),
            rollback_only: self.rollback_only,
            routing_stopped: self.routing_stopped,
            completions: self.completions.len(),
        }
    }

    /// Rewind to `snapshot`. Completion work added since then is run first,
    /// against the exchange as it is now, and discarded. The failure cause is
    /// left alone.
    pub fn restore(&mut self, snapshot: &ExchangeSnapshot) {
        let keep = snapshot.completions.min(self.completions.len());
        let stale = self.completions.split_off(keep);
        for completion in stale {
            completion(self);
        }

        self.input = snapshot.input.clone();
        self.output = snapshot.output.clone();
        self.properties = snapshot.properties.clone();
        self.rollback_only = snapshot.rollback_only;
        self.routing_stopped = snapshot.routing_stopped;
    }

    pub fn body(&self) -> &Value {
        &self.message().body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message_mut().set_body(body);
    }

    // --- failure ------------------------------------------------------------

    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn set_failure(&mut self, error: EngineError) {
        self.failure = Some(error);
    }

    pub fn take_failure(&mut self) -> Option<EngineError> {
        self.failure.take()
    }

    /// Surface the failure cause as an error, for request-response callers
    pub fn into_result(self) -> Result<Exchange> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(self)
    }

    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// End routing for this exchange without failing it
    pub fn stop_routing(&mut self) {
        self.routing_stopped = true;
    }

    pub fn is_routing_stopped(&self) -> bool {
        self.routing_stopped
    }

    // --- properties ---------------------------------------------------------

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // --- completion ---------------------------------------------------------

    pub fn add_on_completion<F>(&mut self, f: F)
    where
        F: FnOnce(&Exchange) + Send + Sync + 'static,
    {
        self.completions.push(Box::new(f));
    }

    /// Move pending completion work onto another exchange
    pub fn handover_completions(&mut self, target: &mut Exchange) {
        target.completions.append(&mut self.completions);
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    /// Run and clear completion work. Called once the exchange is terminal.
    pub fn done(&mut self) {
        let completions = std::mem::take(&mut self.completions);
        for completion in completions {
            completion(self);
        }
    }
}

impl Clone for Exchange {
    /// Copies everything except pending completion work, which has a single owner.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            pattern: self.pattern,
            input: self.input.clone(),
            output: self.output.clone(),
            failure: self.failure.clone(),
            properties: self.properties.clone(),
            route_id: self.route_id.clone(),
            created_at: self.created_at,
            rollback_only: self.rollback_only,
            routing_stopped: self.routing_stopped,
            completions: Vec::new(),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("failure", &self.failure)
            .field("route_id", &self.route_id)
            .field("pending_completions", &self.completions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_output_supersedes_input() {
        let mut exchange = Exchange::in_out("request");
        assert_eq!(exchange.body(), &json!("request"));

        exchange.set_out(Message::new("reply").with_header("status", 200));
        assert_eq!(exchange.body(), &json!("reply"));
        assert_eq!(exchange.in_message().body, json!("request"));

        exchange.promote_out();
        assert!(!exchange.has_out());
        assert_eq!(exchange.in_message().body, json!("reply"));
        assert_eq!(exchange.message().header("status"), Some(&json!(200)));
    }

    #[test]
    fn test_restore_rewinds_and_runs_newer_completions() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut exchange = Exchange::in_only("original");
        exchange.set_property("kept", 1);
        {
            let runs = runs.clone();
            exchange.add_on_completion(move |_| {
                runs.fetch_add(100, Ordering::SeqCst);
            });
        }
        let snapshot = exchange.snapshot();

        exchange.set_body("changed");
        exchange.set_property("attempt", "first");
        exchange.set_rollback_only();
        exchange.stop_routing();
        exchange.set_failure(EngineError::processing("boom"));
        {
            let runs = runs.clone();
            exchange.add_on_completion(move |ex| {
                assert!(ex.is_failed());
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        exchange.restore(&snapshot);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.pending_completions(), 1);
        assert_eq!(exchange.body(), &json!("original"));
        assert_eq!(exchange.property("kept"), Some(&json!(1)));
        assert!(exchange.property("attempt").is_none());
        assert!(!exchange.is_rollback_only());
        assert!(!exchange.is_routing_stopped());
        assert!(exchange.is_failed());
    }

    #[test]
    fn test_sub_exchange_is_isolated() {
        let mut parent = Exchange::in_only("hello");
        parent.set_property("tenant", "acme");
        parent.add_on_completion(|_| {});

        let mut sub = parent.sub_exchange();
        sub.set_body("changed");

        assert_ne!(sub.id(), parent.id());
        assert_eq!(parent.body(), &json!("hello"));
        assert_eq!(sub.property("tenant"), Some(&json!("acme")));
        assert_eq!(sub.pending_completions(), 0);
        assert_eq!(parent.pending_completions(), 1);
    }

    #[test]
    fn test_completions_run_once_and_hand_over() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut resource = Exchange::in_only("polled");
        {
            let runs = runs.clone();
            resource.add_on_completion(move |ex| {
                assert!(!ex.is_failed());
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut parent = Exchange::in_only("trigger");
        resource.handover_completions(&mut parent);
        resource.done();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        parent.done();
        parent.done();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_result_surfaces_failure() {
        let mut exchange = Exchange::in_out("x");
        exchange.set_failure(EngineError::processing("boom"));
        let err = exchange.into_result().unwrap_err();
        assert_eq!(err, EngineError::processing("boom"));
    }

    #[test]
    fn test_body_as_string() {
        assert_eq!(Message::new("text").body_as_string(), "text");
        assert_eq!(Message::default().body_as_string(), "");
        assert_eq!(Message::new(json!({"a": 1})).body_as_string(), "{\"a\":1}");
    }
}
