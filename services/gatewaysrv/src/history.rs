//! Batched history writer
//!
//! Rows arrive on an unbounded channel and are buffered by a single consumer
//! task, which flushes when the buffer reaches the batch threshold or when
//! the periodic timer fires, whichever comes first. The consumer owns the
//! drain, so no row can be written twice and a slow insert simply delays the
//! next timer flush. A failed batch is logged and dropped; on shutdown one
//! final flush writes whatever is still queued.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::model::VariableHistory;
use crate::storage::HistoryStore;

/// Handle to the background history writer
pub struct HistoryWriter {
    tx: mpsc::UnboundedSender<VariableHistory>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HistoryWriter {
    /// Spawn the writer task
    pub fn spawn(
        store: Arc<dyn HistoryStore>,
        batch_size: usize,
        flush_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(store, rx, batch_size.max(1), flush_interval, token));
        Self {
            tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Queue one history row; never blocks the caller
    pub fn enqueue(&self, row: VariableHistory) {
        if self.tx.send(row).is_err() {
            error!("History writer is gone, dropping row");
        }
    }

    /// Wait for the writer to perform its final flush and exit. Call after
    /// cancelling the token passed to [`HistoryWriter::spawn`].
    pub async fn join(&self) {
        let handle = self.task.lock().expect("history task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(
    store: Arc<dyn HistoryStore>,
    mut rx: mpsc::UnboundedReceiver<VariableHistory>,
    batch_size: usize,
    flush_interval: Duration,
    token: CancellationToken,
) {
    let mut buffer: Vec<VariableHistory> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    // The first tick of a tokio interval fires immediately; skip it so the
    // timer measures a full period from startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            row = rx.recv() => match row {
                Some(row) => {
                    buffer.push(row);
                    if buffer.len() >= batch_size {
                        flush(&store, &mut buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                flush(&store, &mut buffer).await;
            }
            _ = token.cancelled() => break,
        }
    }

    // Final synchronous flush: drain whatever is still queued, then write once
    while let Ok(row) = rx.try_recv() {
        buffer.push(row);
    }
    flush(&store, &mut buffer).await;
    info!("History writer stopped");
}

async fn flush(store: &Arc<dyn HistoryStore>, buffer: &mut Vec<VariableHistory>) {
    if buffer.is_empty() {
        return;
    }
    let batch: Vec<VariableHistory> = buffer.drain(..).collect();
    let count = batch.len();
    match store.insert_batch(&batch).await {
        Ok(()) => debug!("Flushed {count} history rows"),
        // Accepted tradeoff: the batch is dropped rather than retried, so a
        // dead store cannot grow memory without bound.
        Err(e) => error!("History flush failed, dropping {count} rows: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryHistoryStore;
    use chrono::Utc;

    fn row(id: u32) -> VariableHistory {
        VariableHistory {
            variable_id: id,
            value: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn threshold_triggers_immediate_flush() {
        let store = Arc::new(MemoryHistoryStore::new());
        let token = CancellationToken::new();
        let writer = HistoryWriter::spawn(
            store.clone(),
            50,
            Duration::from_secs(3600), // timer effectively disabled
            token.clone(),
        );

        for i in 0..50 {
            writer.enqueue(row(i));
        }
        // Give the consumer task a chance to drain the channel
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.batch_sizes(), vec![50]);

        token.cancel();
        writer.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batches() {
        let store = Arc::new(MemoryHistoryStore::new());
        let token = CancellationToken::new();
        let writer = HistoryWriter::spawn(
            store.clone(),
            50,
            Duration::from_secs(30),
            token.clone(),
        );

        for i in 0..10 {
            writer.enqueue(row(i));
        }
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.batch_sizes(), vec![10]);

        token.cancel();
        writer.join().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_rows() {
        let store = Arc::new(MemoryHistoryStore::new());
        let token = CancellationToken::new();
        let writer = HistoryWriter::spawn(
            store.clone(),
            50,
            Duration::from_secs(3600),
            token.clone(),
        );

        for i in 0..7 {
            writer.enqueue(row(i));
        }
        token.cancel();
        writer.join().await;
        assert_eq!(store.rows().len(), 7);
    }

    #[tokio::test]
    async fn failed_batches_are_dropped_not_retried() {
        struct FailingStore;
        #[async_trait::async_trait]
        impl HistoryStore for FailingStore {
            async fn insert_batch(
                &self,
                _rows: &[VariableHistory],
            ) -> crate::error::Result<()> {
                Err(crate::error::GatewaySrvError::storage("disk full"))
            }
        }

        let token = CancellationToken::new();
        let writer = HistoryWriter::spawn(
            Arc::new(FailingStore),
            2,
            Duration::from_secs(3600),
            token.clone(),
        );
        writer.enqueue(row(1));
        writer.enqueue(row(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The writer survives the failure and keeps accepting rows
        writer.enqueue(row(3));
        token.cancel();
        writer.join().await;
    }
}
