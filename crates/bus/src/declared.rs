use crate::error::{Error, Result};

use std::sync::Arc;

use conduit_broker::{Broker, QueueOptions};
use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Queues this bus has already declared, so each is declared once.
#[derive(Clone, Debug, Default)]
pub struct DeclaredQueues {
    queues: Arc<DashMap<String, Arc<OnceCell<()>>>>,
}

impl DeclaredQueues {
    /// Declares `name` unless it has been declared before.
    pub async fn ensure<B: Broker>(&self, broker: &B, name: &str) -> Result<()> {
        let cell = {
            let entry = self.queues.entry(name.to_string()).or_default();
            Arc::clone(entry.value())
        };

        cell.get_or_try_init(|| async {
            broker
                .declare_queue(name, QueueOptions::default())
                .await
                .map_err(Error::transport)
        })
        .await?;

        Ok(())
    }
}
