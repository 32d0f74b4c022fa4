//! Batched upserts that survive bad records
//!
//! Batches are first cut to fit the per-statement parameter budget. A batch
//! rejected for a schema or constraint reason is split at its midpoint and
//! both halves are retried; a single record that is still rejected is
//! dropped and reported. Any other failure is fatal.

use async_trait::async_trait;
use harvest_common::types::{NormalizedRecord, TableSchema};
use harvest_common::{HarvestError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination for normalized records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Columns bound per row for `table`
    async fn column_count(&self, table: &TableSchema) -> Result<usize>;

    /// Insert `records`, overwriting every non-key column on key conflict.
    /// Returns the number of rows affected.
    async fn upsert(&self, table: &TableSchema, records: &[NormalizedRecord]) -> Result<u64>;
}

#[async_trait]
impl<S: RecordSink + ?Sized> RecordSink for Arc<S> {
    async fn column_count(&self, table: &TableSchema) -> Result<usize> {
        (**self).column_count(table).await
    }

    async fn upsert(&self, table: &TableSchema, records: &[NormalizedRecord]) -> Result<u64> {
        (**self).upsert(table, records).await
    }
}

#[derive(Debug, Default)]
pub struct WriteReport {
    pub rows_affected: u64,
    /// One [`HarvestError::UnrecoverableRecord`] per dropped record
    pub dropped: Vec<HarvestError>,
}

impl WriteReport {
    pub fn dropped_ids(&self) -> impl Iterator<Item = &str> {
        self.dropped.iter().filter_map(|e| match e {
            HarvestError::UnrecoverableRecord { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }
}

/// Largest batch whose bound parameters fit in `max_params`
pub fn batch_limit(max_params: usize, column_count: usize) -> usize {
    (max_params / column_count.max(1)).max(1)
}

pub struct AdaptiveWriter<S> {
    sink: S,
    /// Bound-parameter budget per statement; 0 disables pre-splitting
    max_params: usize,
    cancel: CancellationToken,
}

impl<S: RecordSink> AdaptiveWriter<S> {
    pub fn new(sink: S, max_params: usize) -> Self {
        Self {
            sink,
            max_params,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn write_batch(&self, table: &TableSchema, batch: &[NormalizedRecord]) -> Result<u64> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HarvestError::Cancelled),
            res = self.sink.upsert(table, batch) => res,
        }
    }

    /// Upsert `records` into `table`, bisecting rejected batches.
    pub async fn upsert(
        &self,
        table: &TableSchema,
        records: Vec<NormalizedRecord>,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let limit = if self.max_params == 0 {
            records.len()
        } else {
            batch_limit(self.max_params, self.sink.column_count(table).await?)
        };

        // Work list popped from the back; push in reverse to write in order
        let mut pending: Vec<Vec<NormalizedRecord>> = if limit < records.len() {
            debug!(table = %table.name, records = records.len(), limit, "Pre-splitting batch");
            let mut batches: Vec<_> = records.chunks(limit).map(<[_]>::to_vec).collect();
            batches.reverse();
            batches
        } else {
            vec![records]
        };

        while let Some(batch) = pending.pop() {
            match self.write_batch(table, &batch).await {
                Ok(rows) => report.rows_affected += rows,
                Err(e) if e.is_schema_or_constraint() => {
                    if batch.len() == 1 {
                        let dropped = HarvestError::UnrecoverableRecord {
                            id: batch[0].id().to_string(),
                            reason: e.to_string(),
                        };
                        warn!(table = %table.name, error = %dropped, "Dropping record");
                        report.dropped.push(dropped);
                        continue;
                    }

                    warn!(table = %table.name, size = batch.len(), error = %e, "Batch rejected; bisecting");
                    let mut first = batch;
                    let second = first.split_off(first.len() / 2);
                    pending.push(second);
                    pending.push(first);
                },
                Err(e) => return Err(e),
            }
        }

        info!(
            table = %table.name,
            rows = report.rows_affected,
            dropped = report.dropped.len(),
            "Upsert complete"
        );
        Ok(report)
    }
}
