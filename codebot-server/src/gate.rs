//! Deduplication gate in front of the queue.
//!
//! Both ingestion paths submit through [`DedupGate::submit`]. The claim in
//! the store and the enqueue happen in one call, so a key that was claimed
//! is either queued or released again.

use std::sync::Arc;

use chrono::Utc;
use codebot_core::store::EventStore;
use codebot_core::ReviewEvent;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueClosed, QueueSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    SelfAuthored,
    Duplicate,
    /// Store or queue failure; the event was not queued.
    Failed,
}

pub struct DedupGate {
    store: Arc<dyn EventStore>,
    queue: QueueSender,
    bot_login: String,
}

impl DedupGate {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: QueueSender,
        bot_login: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            bot_login: bot_login.into(),
        }
    }

    pub fn bot_login(&self) -> &str {
        &self.bot_login
    }

    pub async fn submit(&self, event: ReviewEvent) -> Admission {
        let key = event.dedup_key();

        if event.is_authored_by(&self.bot_login) {
            debug!("Dropping {}: authored by {}", key, self.bot_login);
            return Admission::SelfAuthored;
        }

        match self.store.claim_event(&key, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Dropping {}: already processed", key);
                return Admission::Duplicate;
            }
            Err(e) => {
                error!("Failed to claim {}: {}", key, e);
                return Admission::Failed;
            }
        }

        match self.queue.send(event).await {
            Ok(()) => {
                info!("Enqueued {} (queue depth {})", key, self.queue.len());
                Admission::Enqueued
            }
            Err(QueueClosed(_)) => {
                warn!("Queue closed, releasing claim on {}", key);
                if let Err(e) = self.store.release_event(&key).await {
                    error!("Failed to release claim on {}: {}", key, e);
                }
                Admission::Failed
            }
        }
    }
}
