//! Transaction boundary around a scope of the processor graph

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, Result};
use tracing::{debug, error, info};

use crate::processor::{run, Processor};

/// Commit/rollback signal contract. Transaction semantics belong to the
/// implementation.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Returns a handle identifying the transaction
    async fn begin(&self, exchange_id: &str) -> Result<String>;
    async fn commit(&self, transaction: &str) -> Result<()>;
    async fn rollback(&self, transaction: &str) -> Result<()>;
}

/// Runs its scope inside a transaction: commit on success, roll back when the
/// exchange failed or was marked rollback-only.
pub struct Transacted {
    manager: Arc<dyn TransactionManager>,
    scope: Arc<dyn Processor>,
}

impl Transacted {
    pub fn new(manager: Arc<dyn TransactionManager>, scope: Arc<dyn Processor>) -> Self {
        Self { manager, scope }
    }
}

#[async_trait]
impl Processor for Transacted {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let transaction = self.manager.begin(exchange.id()).await?;
        debug!(exchange_id = %exchange.id(), transaction = %transaction, "Transaction started");

        run(self.scope.as_ref(), exchange).await;

        if exchange.is_failed() || exchange.is_rollback_only() {
            if let Err(e) = self.manager.rollback(&transaction).await {
                error!(
                    exchange_id = %exchange.id(),
                    transaction = %transaction,
                    error = %e,
                    "Rollback failed"
                );
            }
            info!(
                exchange_id = %exchange.id(),
                transaction = %transaction,
                failed = exchange.is_failed(),
                "Transaction rolled back"
            );
            return Ok(());
        }

        self.manager.commit(&transaction).await?;
        debug!(exchange_id = %exchange.id(), transaction = %transaction, "Transaction committed");
        Ok(())
    }
}
