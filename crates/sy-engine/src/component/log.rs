//! `log:category` - logs each exchange it receives

use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{EngineError, Exchange, Result};
use tracing::{debug, error, info, trace, warn};

use super::{Component, Endpoint, Producer};
use crate::binder::Parameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

pub struct LogComponent;

impl Component for LogComponent {
    fn scheme(&self) -> &str {
        "log"
    }

    fn create_endpoint(&self, uri: &str, remaining: &str, params: &mut Parameters) -> Result<Arc<dyn Endpoint>> {
        if remaining.is_empty() {
            return Err(EngineError::configuration(format!("{}: log category is mandatory", uri)));
        }
        Ok(Arc::new(LogEndpoint {
            uri: uri.to_string(),
            category: remaining.to_string(),
            level: params.take_or("level", LogLevel::Info)?,
            show_headers: params.take_bool("showHeaders", false)?,
            show_body: params.take_bool("showBody", true)?,
        }))
    }
}

pub struct LogEndpoint {
    uri: String,
    category: String,
    level: LogLevel,
    show_headers: bool,
    show_body: bool,
}

impl LogEndpoint {
    fn render(&self, exchange: &Exchange) -> String {
        let message = exchange.message();
        let mut parts = vec![format!("ExchangePattern: {:?}", exchange.pattern())];
        if self.show_headers {
            let mut headers: Vec<String> = message.headers.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            headers.sort();
            parts.push(format!("Headers: {{{}}}", headers.join(", ")));
        }
        if self.show_body {
            parts.push(format!("Body: {}", message.body_as_string()));
        }
        parts.join(", ")
    }
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(LogProducer {
            endpoint: LogEndpoint {
                uri: self.uri.clone(),
                category: self.category.clone(),
                level: self.level,
                show_headers: self.show_headers,
                show_body: self.show_body,
            },
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct LogProducer {
    endpoint: LogEndpoint,
}

#[async_trait]
impl Producer for LogProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let line = self.endpoint.render(exchange);
        let category = &self.endpoint.category;
        let exchange_id = exchange.id();
        match self.endpoint.level {
            LogLevel::Trace => trace!(category = %category, exchange_id = %exchange_id, "{}", line),
            LogLevel::Debug => debug!(category = %category, exchange_id = %exchange_id, "{}", line),
            LogLevel::Info => info!(category = %category, exchange_id = %exchange_id, "{}", line),
            LogLevel::Warn => warn!(category = %category, exchange_id = %exchange_id, "{}", line),
            LogLevel::Error => error!(category = %category, exchange_id = %exchange_id, "{}", line),
        }
        Ok(())
    }
}
