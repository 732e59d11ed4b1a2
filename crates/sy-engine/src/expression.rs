//! Predicates, value expressions and `${...}` text templates

use std::sync::Arc;

use serde_json::Value;
use sy_common::Exchange;

/// Boolean test over an exchange
pub type Predicate = Arc<dyn Fn(&Exchange) -> bool + Send + Sync>;

/// Computes a value from an exchange
pub type Expression = Arc<dyn Fn(&Exchange) -> Value + Send + Sync>;

pub fn predicate<F>(f: F) -> Predicate
where
    F: Fn(&Exchange) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn expression<F>(f: F) -> Expression
where
    F: Fn(&Exchange) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn constant(value: impl Into<Value>) -> Expression {
    let value = value.into();
    Arc::new(move |_| value.clone())
}

/// True when the current message has header `name` equal to `expected`
pub fn header_equals(name: impl Into<String>, expected: impl Into<Value>) -> Predicate {
    let name = name.into();
    let expected = expected.into();
    Arc::new(move |ex| ex.message().header(&name) == Some(&expected))
}

pub fn body_equals(expected: impl Into<Value>) -> Predicate {
    let expected = expected.into();
    Arc::new(move |ex| ex.body() == &expected)
}

/// Render a template against an exchange.
///
/// Placeholders: `${body}`, `${header.NAME}`, `${exchangeProperty.NAME}`,
/// `${exchangeId}`, `${routeId}`. Unknown placeholders are kept verbatim and
/// missing values render empty.
pub fn interpolate(template: &str, exchange: &Exchange) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after[..end];
        match resolve(key, exchange) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn resolve(key: &str, exchange: &Exchange) -> Option<String> {
    if key == "body" {
        return Some(exchange.message().body_as_string());
    }
    if key == "exchangeId" {
        return Some(exchange.id().to_string());
    }
    if key == "routeId" {
        return Some(exchange.route_id().unwrap_or_default().to_string());
    }
    if let Some(name) = key.strip_prefix("header.") {
        return Some(exchange.message().header(name).map(render).unwrap_or_default());
    }
    if let Some(name) = key.strip_prefix("exchangeProperty.") {
        return Some(exchange.property(name).map(render).unwrap_or_default());
    }
    None
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
