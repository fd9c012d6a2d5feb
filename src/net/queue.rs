//! Blocking FIFO of decoded inbound payloads.
//!
//! # Responsibilities
//! - Hand payloads from the session task to readers in arrival order
//! - Park readers while empty, wake one per `put`
//! - Fail parked and later readers once closed and drained

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned by [`InboundQueue`] pops.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed and holds nothing more.
    #[error("queue shut down")]
    ShutDown,

    /// The head element is not an integer; it stays queued.
    #[error("expected an integer, found {0:?}")]
    BadMessagesSequence(String),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<String>,
    closed: bool,
}

/// Thread-safe FIFO with async blocking pops.
#[derive(Debug, Default)]
pub struct InboundQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiter. Items put after `close` are dropped.
    pub fn put(&self, item: String) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
    }

    /// Remove and return the head element, waiting while empty.
    pub async fn pop(&self) -> Result<String, QueueError> {
        self.pop_with(|state| state.items.pop_front().ok_or(QueueError::ShutDown))
            .await
    }

    /// Remove and return the head element as an integer, waiting while empty.
    ///
    /// If the head does not parse the call fails with
    /// [`QueueError::BadMessagesSequence`] and the element is left in place.
    pub async fn pop_int(&self) -> Result<i32, QueueError> {
        self.pop_with(|state| {
            let head = state.items.front().ok_or(QueueError::ShutDown)?;
            let value = head
                .trim()
                .parse::<i32>()
                .map_err(|_| QueueError::BadMessagesSequence(head.clone()))?;
            state.items.pop_front();
            Ok(value)
        })
        .await
    }

    async fn pop_with<T>(
        &self,
        mut take: impl FnMut(&mut QueueState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a put in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if !state.items.is_empty() {
                    return take(&mut state);
                }
                if state.closed {
                    return Err(QueueError::ShutDown);
                }
            }

            notified.await;
        }
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.available.notify_waiters();
    }
}
