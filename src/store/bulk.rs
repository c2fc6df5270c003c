//! # Bulk Writer
//!
//! Buffered, pipelined writer for high-volume documents. Full batches are
//! handed to a background flush task over a bounded channel, so fetching can
//! continue while the previous batch is written. The channel bound applies
//! backpressure when the store falls behind.

use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Document, Store};

/// Batches allowed in flight before `push` waits for the flusher.
const IN_FLIGHT_BATCHES: usize = 2;

/// Totals reported when the writer finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteStats {
    /// Batches handed to the store
    pub batches: usize,
    /// Documents written
    pub written: usize,
    /// Documents that failed (per-id failures plus whole failed batches)
    pub failed: usize,
    /// Set when a batch failed because the store is unreachable
    pub fatal: Option<String>,
}

/// Thread-safe buffered writer for one collection.
pub struct BulkWriter {
    collection: String,
    batch_size: usize,
    buffer: Vec<Document>,
    sender: Option<mpsc::Sender<Vec<Document>>>,
    flusher: Option<JoinHandle<WriteStats>>,
}

impl BulkWriter {
    /// Starts a writer and its flush task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn Store>, collection: &str, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let (sender, receiver) = mpsc::channel(IN_FLIGHT_BATCHES);
        let flusher = tokio::spawn(flush_loop(store, collection.to_string(), receiver));

        Self {
            collection: collection.to_string(),
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            sender: Some(sender),
            flusher: Some(flusher),
        }
    }

    /// Buffers a document, handing off a batch when the buffer is full.
    pub async fn push(&mut self, doc: Document) {
        self.buffer.push(doc);
        if self.buffer.len() >= self.batch_size {
            self.send_buffer().await;
        }
    }

    /// Documents buffered but not yet handed off.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes the tail, waits for every batch to land and returns totals.
    pub async fn finish(mut self) -> WriteStats {
        self.send_buffer().await;
        drop(self.sender.take());

        match self.flusher.take() {
            Some(handle) => match handle.await {
                Ok(stats) => stats,
                Err(e) => {
                    error!("Flush task for '{}' panicked: {}", self.collection, e);
                    WriteStats {
                        fatal: Some(format!("flush task failed: {}", e)),
                        ..Default::default()
                    }
                }
            },
            None => WriteStats::default(),
        }
    }

    async fn send_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let size = batch.len();
        if let Some(sender) = &self.sender {
            if sender.send(batch).await.is_err() {
                error!(
                    "Flush task for '{}' stopped, dropping {} documents",
                    self.collection, size
                );
            }
        }
    }
}

async fn flush_loop(
    store: Arc<dyn Store>,
    collection: String,
    mut receiver: mpsc::Receiver<Vec<Document>>,
) -> WriteStats {
    let mut stats = WriteStats::default();

    while let Some(batch) = receiver.recv().await {
        let size = batch.len();
        stats.batches += 1;

        let store = Arc::clone(&store);
        let target = collection.clone();
        let result =
            tokio::task::spawn_blocking(move || store.bulk_upsert(&target, &batch)).await;

        match result {
            Ok(Ok(outcome)) => {
                for (id, reason) in &outcome.failed {
                    warn!("Write of '{}' to '{}' failed: {}", id, collection, reason);
                }
                stats.written += outcome.succeeded;
                stats.failed += outcome.failed.len();
                debug!(
                    "Flushed {} documents to '{}' ({} failed)",
                    outcome.succeeded,
                    collection,
                    outcome.failed.len()
                );
            }
            Ok(Err(e)) => {
                error!("Bulk write of {} documents to '{}' failed: {}", size, collection, e);
                stats.failed += size;
                if e.is_fatal() && stats.fatal.is_none() {
                    stats.fatal = Some(e.to_string());
                }
            }
            Err(e) => {
                error!("Bulk write task for '{}' aborted: {}", collection, e);
                stats.failed += size;
            }
        }
    }

    stats
}
