//! `contracts_clean` rows from `/markets` payloads

use chrono::{DateTime, Utc};
use harvest_common::types::{
    ColumnType, NormalizedRecord, PayloadError, RawPayload, TableSchema,
};
use serde_json::Value;

use super::{optional_text, required_text, Normalizer};

pub const CONTRACTS_TABLE: &str = "contracts_clean";

pub struct ContractNormalizer {
    table: TableSchema,
}

impl ContractNormalizer {
    pub fn new() -> Self {
        use ColumnType::*;

        let table = TableSchema::new(CONTRACTS_TABLE, "id")
            .column("slug", Text)
            .column("creator_id", Text)
            .column("question", Text)
            .column("description", Text)
            .column("visibility", Text)
            .column("token", Text)
            .column("outcome_type", Text)
            .column("mechanism", Text)
            .column("volume", Double)
            .column("unique_bettor_count", BigInt)
            .column("view_count", Double)
            .column("popularity_score", Double)
            .column("is_resolved", Boolean)
            .column("resolution", Text)
            .column("resolution_probability", Double)
            .column("resolution_time", Timestamp)
            .column("group_slugs", Jsonb)
            .column("created_time", Timestamp)
            .column("close_time", Timestamp)
            .column("last_bet_time", Timestamp)
            .column("last_comment_time", Timestamp)
            .column("is_love", Boolean)
            .column("featured_label", Text)
            .column("is_ranked", Boolean)
            .column("creator_username", Text)
            .column("creator_name", Text)
            .column("collected_at", Timestamp);

        Self { table }
    }
}

impl Default for ContractNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Group slugs arrive as a list or, from some API variants, a
/// comma-separated string. Both become a JSON array of strings.
fn group_slugs(contract: &RawPayload) -> Result<Option<Value>, PayloadError> {
    let slugs: Vec<Value> = match contract.get("groupSlugs") {
        None => return Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
            .collect(),
        Some(Value::String(raw)) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        Some(_) => {
            return Err(PayloadError::malformed(
                "groupSlugs",
                "list or comma-separated string",
            ))
        },
    };

    Ok((!slugs.is_empty()).then_some(Value::Array(slugs)))
}

impl Normalizer for ContractNormalizer {
    fn table(&self) -> &TableSchema {
        &self.table
    }

    fn normalize(
        &self,
        contract: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<NormalizedRecord, PayloadError> {
        Ok(NormalizedRecord::new(required_text(contract, "id")?)
            .with("slug", optional_text(contract, "slug")?)
            .with("creator_id", required_text(contract, "creatorId")?)
            .with("question", required_text(contract, "question")?)
            .with("description", optional_text(contract, "description")?)
            .with("visibility", required_text(contract, "visibility")?)
            .with("token", required_text(contract, "token")?)
            .with("outcome_type", optional_text(contract, "outcomeType")?)
            .with("mechanism", optional_text(contract, "mechanism")?)
            .with("volume", contract.opt_f64("volume")?)
            .with("unique_bettor_count", contract.opt_i64("uniqueBettorCount")?)
            .with("view_count", contract.opt_f64("viewCount")?)
            .with("popularity_score", contract.opt_f64("popularityScore")?)
            .with("is_resolved", contract.opt_bool("isResolved")?)
            .with("resolution", optional_text(contract, "resolution")?)
            .with("resolution_probability", contract.opt_f64("resolutionProbability")?)
            .with("resolution_time", contract.opt_timestamp("resolutionTime")?)
            .with("group_slugs", group_slugs(contract)?)
            .with("created_time", contract.get_timestamp("createdTime")?)
            .with("close_time", contract.opt_timestamp("closeTime")?)
            .with("last_bet_time", contract.opt_timestamp("lastBetTime")?)
            .with("last_comment_time", contract.opt_timestamp("lastCommentTime")?)
            .with("is_love", contract.opt_bool("isLove")?)
            .with("featured_label", optional_text(contract, "featuredLabel")?)
            .with("is_ranked", contract.opt_bool("isRanked")?)
            .with("creator_username", optional_text(contract, "creatorUsername")?)
            .with("creator_name", optional_text(contract, "creatorName")?)
            .with("collected_at", collected_at))
    }
}
