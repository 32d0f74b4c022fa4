//! Payload normalizers
//!
//! A [`Normalizer`] maps one raw API payload onto a row of its target table.
//! The pipeline only cares about the resulting id and field count; column
//! mapping lives entirely in the implementations.

pub mod bets;
pub mod comments;
pub mod contracts;
pub mod users;

pub use bets::BetNormalizer;
pub use comments::CommentNormalizer;
pub use contracts::ContractNormalizer;
pub use users::UserNormalizer;

use chrono::{DateTime, Utc};
use harvest_common::types::{NormalizedRecord, PayloadError, RawPayload, TableSchema};
use tracing::{info, warn};

pub trait Normalizer: Send + Sync {
    /// Table the normalized records are written to
    fn table(&self) -> &TableSchema;

    fn normalize(
        &self,
        payload: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<NormalizedRecord, PayloadError>;
}

/// Normalized records plus the count of payloads that were rejected
#[derive(Debug, Default)]
pub struct Prepared {
    pub records: Vec<NormalizedRecord>,
    pub skipped: usize,
}

/// Run `normalizer` over `payloads`, skipping malformed items
pub fn prepare_records<N>(
    normalizer: &N,
    payloads: &[RawPayload],
    collected_at: DateTime<Utc>,
) -> Prepared
where
    N: Normalizer + ?Sized,
{
    let mut prepared = Prepared {
        records: Vec::with_capacity(payloads.len()),
        skipped: 0,
    };

    for payload in payloads {
        match normalizer.normalize(payload, collected_at) {
            Ok(record) => prepared.records.push(record),
            Err(e) => {
                warn!(
                    table = %normalizer.table().name,
                    id = payload.cursor("id").as_deref().unwrap_or("<none>"),
                    error = %e,
                    "Skipping malformed item"
                );
                prepared.skipped += 1;
            },
        }
    }

    if prepared.skipped > 0 {
        info!(
            table = %normalizer.table().name,
            skipped = prepared.skipped,
            "Skipped malformed items in this batch"
        );
    }
    prepared
}

/// Required string; surrounding whitespace is trimmed and empty is missing
fn required_text(payload: &RawPayload, field: &str) -> Result<String, PayloadError> {
    optional_text(payload, field)?.ok_or_else(|| PayloadError::Missing {
        field: field.to_string(),
    })
}

/// Optional string; blank values read as absent
fn optional_text(payload: &RawPayload, field: &str) -> Result<Option<String>, PayloadError> {
    Ok(payload
        .opt_str(field)?
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}
