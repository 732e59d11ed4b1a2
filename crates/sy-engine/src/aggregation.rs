//! Merge strategies for enrich, poll-enrich and multicast results

use std::sync::Arc;

use sy_common::{Exchange, Result};

/// Merges a resource exchange into the original one
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, original: &mut Exchange, resource: Exchange) -> Result<()>;
}

/// Replace the original's body and headers with the resource's
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceMessage;

impl AggregationStrategy for ReplaceMessage {
    fn aggregate(&self, original: &mut Exchange, resource: Exchange) -> Result<()> {
        *original.message_mut() = resource.message().clone();
        Ok(())
    }
}

/// Replace only the body, keeping the original's headers
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceBody;

impl AggregationStrategy for ReplaceBody {
    fn aggregate(&self, original: &mut Exchange, resource: Exchange) -> Result<()> {
        original.set_body(resource.body().clone());
        Ok(())
    }
}

/// Take the resource's message and merge its properties over the original's
#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, original: &mut Exchange, resource: Exchange) -> Result<()> {
        *original.message_mut() = resource.message().clone();
        for (key, value) in resource.properties() {
            original.set_property(key.clone(), value.clone());
        }
        Ok(())
    }
}

pub struct FnAggregation<F> {
    f: F,
}

impl<F> AggregationStrategy for FnAggregation<F>
where
    F: Fn(&mut Exchange, Exchange) -> Result<()> + Send + Sync,
{
    fn aggregate(&self, original: &mut Exchange, resource: Exchange) -> Result<()> {
        (self.f)(original, resource)
    }
}

pub fn aggregate_fn<F>(f: F) -> Arc<dyn AggregationStrategy>
where
    F: Fn(&mut Exchange, Exchange) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnAggregation { f })
}
