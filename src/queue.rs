//! Batched queue writer.

use crate::error::Result;
use crate::model::DeliveryRecord;
use crate::store::Store;
use tracing::debug;

/// Buffers delivery records and writes them to the queue store in
/// fixed-size batches. The caller drives flushing: [`push`](Self::push)
/// reports when the buffer is full, and a final [`flush`](Self::flush)
/// drains the partial batch at stream end. A flush failure leaves the
/// buffer intact and surfaces to the caller.
pub struct QueueWriter<'a, S: Store + ?Sized> {
    store: &'a S,
    app: &'a str,
    batch_size: usize,
    buf: Vec<DeliveryRecord>,
    total: u64,
}

impl<'a, S: Store + ?Sized> QueueWriter<'a, S> {
    pub fn new(store: &'a S, app: &'a str, batch_size: usize) -> QueueWriter<'a, S> {
        let batch_size = batch_size.max(1);
        QueueWriter {
            store,
            app,
            batch_size,
            buf: Vec::with_capacity(batch_size),
            total: 0,
        }
    }

    /// Accept one record; returns true when the buffer has reached the
    /// batch size and must be flushed.
    pub fn push(&mut self, record: DeliveryRecord) -> bool {
        self.buf.push(record);
        self.total += 1;
        self.buf.len() >= self.batch_size
    }

    /// Durably write the buffered batch and clear it. Returns the number of
    /// records written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        self.store.insert_deliveries(self.app, &self.buf).await?;
        let written = self.buf.len();
        self.buf.clear();
        debug!(written, total = self.total, "flushed delivery batch");
        Ok(written)
    }

    /// Records accepted so far, flushed or not.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
