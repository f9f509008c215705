//! In-process publish/subscribe fan-out for audit entries.
//!
//! Bounded, drop-on-full subscriber inboxes so a slow consumer can never
//! slow the publisher down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::entry::AuditEntry;

const DEFAULT_BUFFER: usize = 1000;

struct Subscriber {
    tx: mpsc::Sender<Arc<AuditEntry>>,
}

pub struct Streamer {
    inner: AsyncMutex<Inner>,
    next_sub_id: AtomicU64,
}

struct Inner {
    buffer: VecDeque<Arc<AuditEntry>>,
    capacity: usize,
    subscribers: HashMap<u64, Subscriber>,
}

impl Streamer {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_BUFFER } else { capacity };
        Streamer {
            inner: AsyncMutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                capacity,
                subscribers: HashMap::new(),
            }),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub async fn publish(&self, entry: AuditEntry) {
        let entry = Arc::new(entry);
        let mut inner = self.inner.lock().await;
        if inner.buffer.len() >= inner.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(entry.clone());

        inner.subscribers.retain(|_, sub| match sub.tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub async fn subscribe(self: &Arc<Self>, capacity: usize) -> (u64, mpsc::Receiver<Arc<AuditEntry>>) {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut inner = self.inner.lock().await;
        inner.subscribers.insert(id, Subscriber { tx });
        (id, rx)
    }

    /// Idempotent: unsubscribing a already-unknown id is a no-op.
    pub async fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&id);
    }

    pub async fn recent(&self, limit: usize) -> Vec<Arc<AuditEntry>> {
        let inner = self.inner.lock().await;
        let skip = inner.buffer.len().saturating_sub(limit);
        inner.buffer.iter().skip(skip).cloned().collect()
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.clear();
    }
}

/// Single-handler pipeline stage fed by a [`Streamer`] subscription.
/// Terminates when its cancellation token is triggered; handler errors go
/// to a bounded, drop-on-full error channel rather than killing the loop.
pub struct StreamProcessor {
    cancel: Arc<tokio::sync::Notify>,
}

impl StreamProcessor {
    pub fn spawn<F>(
        mut rx: mpsc::Receiver<Arc<AuditEntry>>,
        error_capacity: usize,
        mut handler: F,
    ) -> (Self, mpsc::Receiver<anyhow::Error>)
    where
        F: FnMut(&AuditEntry) -> anyhow::Result<()> + Send + 'static,
    {
        let cancel = Arc::new(tokio::sync::Notify::new());
        let cancel_task = cancel.clone();
        let (err_tx, err_rx) = mpsc::channel(error_capacity.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_task.notified() => break,
                    maybe_entry = rx.recv() => {
                        match maybe_entry {
                            Some(entry) => {
                                if let Err(e) = handler(&entry) {
                                    let _ = err_tx.try_send(e);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        (StreamProcessor { cancel }, err_rx)
    }

    pub fn stop(&self) {
        self.cancel.notify_one();
    }
}

/// Accumulates published entries until `batch_size` or `flush_interval`
/// elapses, whichever comes first; flushes whatever remains on stop.
pub struct BatchedStreamer {
    batch_size: usize,
    buffer: AsyncMutex<Vec<Arc<AuditEntry>>>,
}

impl BatchedStreamer {
    pub fn new(batch_size: usize) -> Self {
        BatchedStreamer {
            batch_size: batch_size.max(1),
            buffer: AsyncMutex::new(Vec::new()),
        }
    }

    /// Returns `Some(batch)` when the addition fills the batch.
    pub async fn add(&self, entry: Arc<AuditEntry>) -> Option<Vec<Arc<AuditEntry>>> {
        let mut buf = self.buffer.lock().await;
        buf.push(entry);
        if buf.len() >= self.batch_size {
            Some(std::mem::take(&mut *buf))
        } else {
            None
        }
    }

    pub async fn flush(&self) -> Vec<Arc<AuditEntry>> {
        let mut buf = self.buffer.lock().await;
        std::mem::take(&mut *buf)
    }

    /// Spawns a background task that flushes whatever has accumulated
    /// every `flush_interval`, even if `batch_size` was never reached,
    /// sending non-empty batches to `tx`. `add()`'s own size-triggered
    /// flush still fires independently — this covers the "whichever
    /// comes first" half driven by time instead of volume. Performs one
    /// last flush before exiting once `cancel` fires.
    pub fn spawn_interval_flush(
        self: Arc<Self>,
        flush_interval: Duration,
        tx: mpsc::Sender<Vec<Arc<AuditEntry>>>,
        cancel: Arc<tokio::sync::Notify>,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = cancel.notified() => {
                        let batch = self.flush().await;
                        if !batch.is_empty() {
                            let _ = tx.send(batch).await;
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        let batch = self.flush().await;
                        if !batch.is_empty() {
                            let _ = tx.send(batch).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Action, Flags};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_entry(id: u64) -> AuditEntry {
        AuditEntry {
            id,
            timestamp: Utc::now(),
            node_id: "node-a".to_string(),
            job_id: None,
            operation_id: Uuid::new_v4(),
            role_used: "app".to_string(),
            actor: "svc".to_string(),
            source_component: "api".to_string(),
            action: Action::Select,
            table_name: None,
            query: None,
            query_hash: None,
            rows_affected: 0,
            duration_ms: 0,
            metadata: Default::default(),
            prev_hash: None,
            entry_hash: String::new(),
            flags: Flags::default(),
        }
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let streamer = Streamer::new(2);
        for i in 1..=3 {
            streamer.publish(sample_entry(i)).await;
        }
        let recent = streamer.recent(10).await;
        assert_eq!(recent.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let streamer = Arc::new(Streamer::new(10));
        let (_id, mut rx) = streamer.subscribe(1).await;

        for i in 1..=5 {
            streamer.publish(sample_entry(i)).await;
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let streamer = Arc::new(Streamer::new(10));
        let (id, _rx) = streamer.subscribe(4).await;
        streamer.unsubscribe(id).await;
        streamer.unsubscribe(id).await;
    }

    #[tokio::test]
    async fn batched_streamer_flushes_at_batch_size() {
        let batcher = BatchedStreamer::new(2);
        assert!(batcher.add(Arc::new(sample_entry(1))).await.is_none());
        let batch = batcher.add(Arc::new(sample_entry(2))).await;
        assert_eq!(batch.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batched_streamer_flushes_on_interval_below_batch_size() {
        let batcher = Arc::new(BatchedStreamer::new(100));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = Arc::new(tokio::sync::Notify::new());

        batcher.clone().spawn_interval_flush(Duration::from_millis(50), tx, cancel.clone());
        assert!(batcher.add(Arc::new(sample_entry(1))).await.is_none());

        tokio::time::advance(Duration::from_millis(60)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        cancel.notify_one();
    }
}
