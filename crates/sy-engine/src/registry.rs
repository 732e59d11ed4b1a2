//! Endpoint registry
//!
//! Resolves URIs to endpoints through the component registered for the scheme
//! and caches one endpoint per normalised URI.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use sy_common::{EngineError, Result};
use tracing::{debug, info, warn};

use crate::binder::Parameters;
use crate::component::{Component, Endpoint};
use crate::uri::EndpointUri;

#[derive(Default)]
pub struct EndpointRegistry {
    components: DashMap<String, Arc<dyn Component>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_component(&self, component: Arc<dyn Component>) {
        let scheme = component.scheme().to_ascii_lowercase();
        if self.components.insert(scheme.clone(), component).is_some() {
            warn!(scheme = %scheme, "Replaced existing component");
        } else {
            debug!(scheme = %scheme, "Registered component");
        }
    }

    pub fn component(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.components.get(&scheme.to_ascii_lowercase()).map(|c| c.clone())
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
        self.resolve_uri(EndpointUri::parse(uri)?)
    }

    /// Resolve with an explicit parameter map merged into the query
    pub fn resolve_with(&self, uri: &str, params: BTreeMap<String, String>) -> Result<Arc<dyn Endpoint>> {
        self.resolve_uri(EndpointUri::parse_with(uri, params)?)
    }

    fn resolve_uri(&self, uri: EndpointUri) -> Result<Arc<dyn Endpoint>> {
        let key = uri.normalized();
        if let Some(endpoint) = self.endpoints.get(&key) {
            return Ok(endpoint.clone());
        }

        let component = self
            .component(uri.scheme())
            .ok_or_else(|| EngineError::configuration(format!("no component registered for scheme '{}'", uri.scheme())))?;

        // Created outside the cache lock; a racing resolution of the same uri
        // keeps whichever instance was inserted first.
        let mut params = Parameters::new(uri.params().clone());
        let endpoint = component.create_endpoint(&key, uri.path(), &mut params)?;
        params.finish(&key, component.lenient_properties())?;

        let endpoint = self.endpoints.entry(key.clone()).or_insert(endpoint).clone();
        debug!(uri = %key, "Resolved endpoint");
        Ok(endpoint)
    }

    /// Normalised URIs of every cached endpoint
    pub fn endpoints(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    /// Drop every cached endpoint
    pub fn shutdown(&self) {
        let count = self.endpoints.len();
        self.endpoints.clear();
        info!(endpoints = count, "Endpoint registry cleared");
    }
}
