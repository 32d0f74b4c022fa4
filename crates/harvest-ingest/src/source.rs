//! Resumable, chunked stream of subjects in ascending id order
//!
//! Resuming by label relies on label order agreeing with id order. When the
//! label is gone the stream restarts at the first subject whose label sorts
//! after it; if the two orders disagree some subjects can be skipped or
//! revisited.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use harvest_common::types::{Subject, WorkChunk};
use harvest_common::{HarvestError, Result};
use tracing::info;

/// Where an ordered subject read begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Beginning,
    /// Inclusive lower bound on the id
    AtId(String),
    /// Every subject whose label sorts strictly after this one
    AfterLabel(String),
}

/// Ordered subject source backing [`stream_chunks`]
#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Exact-match lookup of a label's id
    async fn resolve_label(&self, label: &str) -> Result<Option<String>>;

    /// Subjects ordered by id ascending, fetched incrementally
    fn fetch(&self, start: StartPoint) -> BoxStream<'_, Result<Subject>>;
}

/// A subject and how many harvested records it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedSubject {
    pub subject: Subject,
    pub item_count: u64,
}

/// Subjects ranked by harvested activity, feeding the per-user stages
#[async_trait]
pub trait RankedSubjects: Send + Sync {
    /// At most `limit` subjects with at least one record, most records
    /// first, ties broken by id
    async fn top_subjects(&self, limit: usize) -> Result<Vec<RankedSubject>>;
}

/// Turn an optional resume label into a concrete start point
pub async fn resolve_start<S>(store: &S, start_key: Option<&str>) -> Result<StartPoint>
where
    S: SubjectStore + ?Sized,
{
    let Some(label) = start_key else {
        return Ok(StartPoint::Beginning);
    };

    match store.resolve_label(label).await? {
        Some(id) => {
            info!(label, id = %id, "Resuming at subject");
            Ok(StartPoint::AtId(id))
        },
        None => {
            info!(label, "Resume label not found; continuing with the next label");
            Ok(StartPoint::AfterLabel(label.to_string()))
        },
    }
}

/// Stream `chunk_size`-subject chunks, optionally resuming at `start_key`.
///
/// Every chunk is full except possibly the last. Subjects are never held in
/// memory beyond the chunk being built.
pub async fn stream_chunks<'a, S>(
    store: &'a S,
    chunk_size: usize,
    start_key: Option<&str>,
) -> Result<BoxStream<'a, Result<WorkChunk>>>
where
    S: SubjectStore + ?Sized,
{
    if chunk_size == 0 {
        return Err(HarvestError::config("chunk size must be at least 1"));
    }

    let start = resolve_start(store, start_key).await?;
    Ok(store
        .fetch(start)
        .try_chunks(chunk_size)
        .map_err(|e| e.1)
        .boxed())
}
