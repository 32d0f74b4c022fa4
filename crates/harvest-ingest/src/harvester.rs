//! Fan a chunk of subjects out across a bounded pool of workers
//!
//! Each subject is gated with [`quick_check`]; subjects that pass have
//! their full history drained. Failures stay with the subject that caused
//! them, panics included, so one bad subject never fails its siblings or
//! the chunk.

use futures::FutureExt;
use harvest_common::types::{RawPayload, Subject};
use harvest_common::{HarvestError, Result};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ApiClient;
use crate::gate::quick_check;
use crate::pagination::{CursorPaginator, Endpoint};

/// What happened to one subject in a harvesting pass
#[derive(Debug)]
pub enum SubjectOutcome {
    /// Passed the gate and yielded payloads. `stopped` holds the error that
    /// cut pagination short, if any; payloads before it are kept.
    Qualified {
        payloads: Vec<RawPayload>,
        stopped: Option<HarvestError>,
    },
    /// Below threshold, or passed the gate but yielded nothing
    Skipped,
    /// Pagination failed before any payload arrived
    Failed(HarvestError),
}

/// Merged result of one chunk
#[derive(Debug, Default)]
pub struct ChunkHarvest {
    pub payloads: Vec<RawPayload>,
    pub qualifying_count: usize,
    pub qualifying_labels: Vec<String>,
    pub skipped: usize,
    /// Subjects whose fetch hit an error, including qualifying ones that
    /// kept a partial history
    pub failed: usize,
}

impl ChunkHarvest {
    fn record(&mut self, subject: &Subject, outcome: SubjectOutcome) {
        match outcome {
            SubjectOutcome::Qualified { payloads, stopped } => {
                if stopped.is_some() {
                    self.failed += 1;
                }
                self.qualifying_count += 1;
                self.qualifying_labels.push(subject.label.clone());
                self.payloads.extend(payloads);
            },
            SubjectOutcome::Skipped => self.skipped += 1,
            SubjectOutcome::Failed(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: ChunkHarvest) {
        self.payloads.extend(other.payloads);
        self.qualifying_count += other.qualifying_count;
        self.qualifying_labels.extend(other.qualifying_labels);
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Await one subject's harvest; a panic fails that subject only
async fn isolate<F>(subject: &Subject, harvest: F) -> SubjectOutcome
where
    F: Future<Output = SubjectOutcome>,
{
    match AssertUnwindSafe(harvest).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(subject = %subject, panic = %message, "Subject harvest panicked");
            SubjectOutcome::Failed(HarvestError::Panicked(message))
        },
    }
}

/// Gate-then-pull harvester for one paginated endpoint
#[derive(Clone)]
pub struct ChunkedHarvester {
    client: ApiClient,
    endpoint: Endpoint,
    page_size: usize,
    threshold: usize,
}

impl ChunkedHarvester {
    pub fn new(client: ApiClient, endpoint: Endpoint, page_size: usize, threshold: usize) -> Self {
        Self {
            client,
            endpoint,
            page_size,
            threshold,
        }
    }

    /// Gate one subject and, if it qualifies, drain its full history
    pub async fn harvest_subject(&self, subject: &Subject) -> SubjectOutcome {
        if !quick_check(&self.client, self.endpoint, subject, self.threshold).await {
            debug!(subject = %subject, threshold = self.threshold, "Below threshold; skipped");
            return SubjectOutcome::Skipped;
        }

        info!(subject = %subject, "Qualifies; fetching full history");
        let drained = CursorPaginator::new(&self.client, self.endpoint, self.page_size)
            .for_subject(subject.id.as_str())
            .drain()
            .await;

        match (drained.payloads.is_empty(), drained.stopped) {
            (true, None) => SubjectOutcome::Skipped,
            (true, Some(e)) => {
                warn!(subject = %subject, error = %e, "Failed to fetch history");
                SubjectOutcome::Failed(e)
            },
            (false, stopped) => {
                if let Some(ref e) = stopped {
                    warn!(
                        subject = %subject,
                        pages = drained.pages,
                        error = %e,
                        "History fetch stopped early; keeping partial result"
                    );
                }
                SubjectOutcome::Qualified {
                    payloads: drained.payloads,
                    stopped,
                }
            },
        }
    }

    async fn harvest_sequential(&self, subjects: &[Subject]) -> Result<ChunkHarvest> {
        let cancel = self.client.cancellation();
        let mut harvest = ChunkHarvest::default();

        for subject in subjects {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let outcome = isolate(subject, self.harvest_subject(subject)).await;
            harvest.record(subject, outcome);
        }

        // A cancellation mid-subject turns its outcome into noise
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        Ok(harvest)
    }

    /// Harvest `subjects` with at most `worker_count` concurrent workers.
    ///
    /// Subjects are split into contiguous sub-chunks of
    /// `ceil(len / worker_count)`; results are merged in sub-chunk order once
    /// every worker has finished. Only cancellation fails the call.
    pub async fn process(&self, subjects: &[Subject], worker_count: usize) -> Result<ChunkHarvest> {
        if worker_count <= 1 || subjects.len() <= 1 {
            return self.harvest_sequential(subjects).await;
        }

        let sub_chunk_size = subjects.len().div_ceil(worker_count);
        let handles: Vec<(usize, JoinHandle<Result<ChunkHarvest>>)> = subjects
            .chunks(sub_chunk_size)
            .map(|sub_chunk| {
                let worker = self.clone();
                let sub_chunk = sub_chunk.to_vec();
                let size = sub_chunk.len();
                let handle = tokio::spawn(async move { worker.harvest_sequential(&sub_chunk).await });
                (size, handle)
            })
            .collect();

        debug!(
            subjects = subjects.len(),
            workers = handles.len(),
            sub_chunk_size,
            "Dispatched sub-chunks"
        );

        let mut merged = ChunkHarvest::default();
        let mut cancelled = false;

        for (worker, (size, handle)) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(harvest)) => merged.merge(harvest),
                Ok(Err(HarvestError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    error!(worker, error = %e, "Worker failed");
                    merged.failed += size;
                },
                Err(e) => {
                    error!(worker, error = %e, "Worker panicked");
                    merged.failed += size;
                },
            }
        }

        if cancelled {
            return Err(HarvestError::Cancelled);
        }
        Ok(merged)
    }
}
