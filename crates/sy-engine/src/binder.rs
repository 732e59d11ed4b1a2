//! Typed parameter binding for endpoint configuration
//!
//! Components pull the keys they understand out of [`Parameters`] into their
//! own typed config struct. Whatever is left at the end is reported in one
//! aggregated `UnknownParameters` error.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use sy_common::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct Parameters {
    remaining: BTreeMap<String, String>,
}

impl Parameters {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self { remaining: params }
    }

    pub fn take_str(&mut self, key: &str) -> Option<String> {
        self.remaining.remove(key)
    }

    pub fn require_str(&mut self, key: &str) -> Result<String> {
        match self.take_str(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(EngineError::configuration(format!("missing mandatory parameter '{}'", key))),
        }
    }

    pub fn take<T>(&mut self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.remaining.remove(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                EngineError::configuration(format!("parameter '{}' has invalid value '{}': {}", key, raw, e))
            }),
        }
    }

    pub fn take_or<T>(&mut self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.take(key)?.unwrap_or(default))
    }

    pub fn take_bool(&mut self, key: &str, default: bool) -> Result<bool> {
        self.take_or(key, default)
    }

    /// A duration given in milliseconds
    pub fn take_millis(&mut self, key: &str) -> Result<Option<Duration>> {
        Ok(self.take::<u64>(key)?.map(Duration::from_millis))
    }

    /// A duration given in whole seconds
    pub fn take_seconds(&mut self, key: &str) -> Result<Option<Duration>> {
        Ok(self.take::<u64>(key)?.map(Duration::from_secs))
    }

    /// Pull every key starting with `prefix`, returned with the prefix stripped.
    /// Used for pass-through maps such as `additionalProperties.*`.
    pub fn take_prefixed(&mut self, prefix: &str) -> BTreeMap<String, String> {
        let keys: Vec<String> = self
            .remaining
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|k| {
                let value = self.remaining.remove(&k)?;
                Some((k[prefix.len()..].to_string(), value))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn unconsumed(&self) -> Vec<String> {
        self.remaining.keys().cloned().collect()
    }

    /// Fail with every unconsumed key at once, unless binding is lenient
    pub fn finish(self, uri: &str, lenient: bool) -> Result<()> {
        if self.remaining.is_empty() || lenient {
            return Ok(());
        }
        Err(EngineError::UnknownParameters {
            uri: uri.to_string(),
            keys: self.unconsumed(),
        })
    }
}
