//! `comments_clean` rows from `/comments` payloads

use chrono::{DateTime, Utc};
use harvest_common::types::{
    ColumnType, NormalizedRecord, PayloadError, RawPayload, TableSchema,
};
use serde_json::Value;

use super::{optional_text, required_text, Normalizer};

pub const COMMENTS_TABLE: &str = "comments_clean";

pub struct CommentNormalizer {
    table: TableSchema,
}

impl CommentNormalizer {
    pub fn new() -> Self {
        use ColumnType::*;

        let table = TableSchema::new(COMMENTS_TABLE, "id")
            .column("comment_type", Text)
            .column("user_id", Text)
            .column("contract_id", Text)
            .column("reply_to_comment_id", Text)
            .column("created_time", Timestamp)
            .column("content", Jsonb)
            .column("text", Text)
            .column("likes", BigInt)
            .column("dislikes", BigInt)
            .column("hidden", Boolean)
            .column("pinned", Boolean)
            .column("deleted", Boolean)
            .column("edited_time", Timestamp)
            .column("is_api", Boolean)
            .column("user_username", Text)
            .column("user_name", Text)
            .column("user_avatar_url", Text)
            .column("bet_id", Text)
            .column("bettor_id", Text)
            .column("bettor_username", Text)
            .column("bet_amount", Double)
            .column("bet_outcome", Text)
            .column("visibility", Text)
            .column("bounty_awarded", Double)
            .column("collected_at", Timestamp);

        Self { table }
    }
}

impl Default for CommentNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rich-text body: a JSON object, possibly delivered as an encoded string
fn content(comment: &RawPayload) -> Result<Value, PayloadError> {
    match comment.get("content") {
        None => Err(PayloadError::missing("content")),
        Some(Value::Object(body)) => Ok(Value::Object(body.clone())),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(body @ Value::Object(_)) => Ok(body),
            _ => Err(PayloadError::malformed("content", "JSON object")),
        },
        Some(_) => Err(PayloadError::malformed("content", "JSON object")),
    }
}

impl Normalizer for CommentNormalizer {
    fn table(&self) -> &TableSchema {
        &self.table
    }

    fn normalize(
        &self,
        comment: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<NormalizedRecord, PayloadError> {
        Ok(NormalizedRecord::new(required_text(comment, "id")?)
            .with("comment_type", required_text(comment, "commentType")?)
            .with("user_id", required_text(comment, "userId")?)
            .with("contract_id", optional_text(comment, "contractId")?)
            .with("reply_to_comment_id", optional_text(comment, "replyToCommentId")?)
            .with("created_time", comment.get_timestamp("createdTime")?)
            .with("content", content(comment)?)
            .with("text", optional_text(comment, "text")?)
            .with("likes", comment.opt_i64("likes")?)
            .with("dislikes", comment.opt_i64("dislikes")?)
            .with("hidden", comment.opt_bool("hidden")?)
            .with("pinned", comment.opt_bool("pinned")?)
            .with("deleted", comment.opt_bool("deleted")?)
            .with("edited_time", comment.opt_timestamp("editedTime")?)
            .with("is_api", comment.opt_bool("isApi")?)
            .with("user_username", required_text(comment, "userUsername")?)
            .with("user_name", required_text(comment, "userName")?)
            .with("user_avatar_url", optional_text(comment, "userAvatarUrl")?)
            .with("bet_id", optional_text(comment, "betId")?)
            .with("bettor_id", optional_text(comment, "bettorId")?)
            .with("bettor_username", optional_text(comment, "bettorUsername")?)
            .with("bet_amount", comment.opt_f64("betAmount")?)
            .with("bet_outcome", optional_text(comment, "betOutcome")?)
            .with("visibility", optional_text(comment, "visibility")?)
            .with("bounty_awarded", comment.opt_f64("bountyAwarded")?)
            .with("collected_at", collected_at))
    }
}
