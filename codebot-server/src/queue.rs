//! Bounded FIFO shared by both ingestion paths and every worker.

use std::sync::Arc;
use std::time::Duration;

use codebot_core::ReviewEvent;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How long a worker waits for an event before rechecking for shutdown.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("event queue is closed")]
pub struct QueueClosed(pub ReviewEvent);

#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<ReviewEvent>,
}

impl QueueSender {
    /// Enqueue, waiting for capacity when the queue is full.
    pub async fn send(&self, event: ReviewEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).await.map_err(|e| QueueClosed(e.0))
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum Received {
    Event(ReviewEvent),
    TimedOut,
    Closed,
    Cancelled,
}

/// Receiving half. Clones share the same underlying receiver, so each
/// event is delivered to exactly one worker.
#[derive(Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<ReviewEvent>>>,
}

impl QueueReceiver {
    pub async fn recv_timeout(&self, timeout: Duration) -> Received {
        self.recv_or_cancel(timeout, &CancellationToken::new()).await
    }

    /// Like [`recv_timeout`](Self::recv_timeout), but returns as soon as
    /// `cancel` fires, both while waiting for the shared receiver and while
    /// holding it.
    pub async fn recv_or_cancel(&self, timeout: Duration, cancel: &CancellationToken) -> Received {
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return Received::Cancelled,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = cancel.cancelled() => Received::Cancelled,
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Ok(Some(event)) => Received::Event(event),
                Ok(None) => Received::Closed,
                Err(_) => Received::TimedOut,
            },
        }
    }
}

pub fn channel(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}
