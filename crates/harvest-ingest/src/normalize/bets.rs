//! `bets_clean` rows from `/bets` payloads

use chrono::{DateTime, Utc};
use harvest_common::types::{
    ColumnType, NormalizedRecord, PayloadError, RawPayload, TableSchema,
};

use super::{optional_text, required_text, Normalizer};

pub const BETS_TABLE: &str = "bets_clean";

pub struct BetNormalizer {
    table: TableSchema,
}

impl BetNormalizer {
    pub fn new() -> Self {
        use ColumnType::*;

        let table = TableSchema::new(BETS_TABLE, "id")
            .column("user_id", Text)
            .column("contract_id", Text)
            .column("answer_id", Text)
            .column("created_time", Timestamp)
            .column("updated_time", Timestamp)
            .column("amount", Double)
            .column("loan_amount", Double)
            .column("outcome", Text)
            .column("shares", Double)
            .column("prob_before", Double)
            .column("prob_after", Double)
            .column("liquidity_fee", Double)
            .column("creator_fee", Double)
            .column("platform_fee", Double)
            .column("is_api", Boolean)
            .column("is_redemption", Boolean)
            .column("challenge_slug", Text)
            .column("reply_to_comment_id", Text)
            .column("bet_group_id", Text)
            .column("limit_prob", Double)
            .column("is_cancelled", Boolean)
            .column("order_amount", Double)
            .column("is_filled", Boolean)
            .column("expires_at", Timestamp)
            .column("collected_at", Timestamp);

        Self { table }
    }
}

impl Default for BetNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer for BetNormalizer {
    fn table(&self) -> &TableSchema {
        &self.table
    }

    fn normalize(
        &self,
        bet: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<NormalizedRecord, PayloadError> {
        // Missing fee breakdown means no fees were recorded
        let fees = RawPayload::new(bet.opt_object("fees")?.cloned().unwrap_or_default());

        Ok(NormalizedRecord::new(required_text(bet, "id")?)
            .with("user_id", required_text(bet, "userId")?)
            .with("contract_id", required_text(bet, "contractId")?)
            .with("answer_id", optional_text(bet, "answerId")?)
            .with("created_time", bet.get_timestamp("createdTime")?)
            .with("updated_time", bet.opt_timestamp("updatedTime")?)
            .with("amount", bet.get_f64("amount")?)
            .with("loan_amount", bet.opt_f64("loanAmount")?)
            .with("outcome", required_text(bet, "outcome")?)
            .with("shares", bet.get_f64("shares")?)
            .with("prob_before", bet.get_f64("probBefore")?)
            .with("prob_after", bet.get_f64("probAfter")?)
            .with("liquidity_fee", fees.opt_f64("liquidityFee")?)
            .with("creator_fee", fees.opt_f64("creatorFee")?)
            .with("platform_fee", fees.opt_f64("platformFee")?)
            .with("is_api", bet.opt_bool("isApi")?)
            .with("is_redemption", bet.get_bool("isRedemption")?)
            .with("challenge_slug", optional_text(bet, "challengeSlug")?)
            .with("reply_to_comment_id", optional_text(bet, "replyToCommentId")?)
            .with("bet_group_id", optional_text(bet, "betGroupId")?)
            .with("limit_prob", bet.opt_f64("limitProb")?)
            .with("is_cancelled", bet.opt_bool("isCancelled")?)
            .with("order_amount", bet.opt_f64("orderAmount")?)
            .with("is_filled", bet.opt_bool("isFilled")?)
            .with("expires_at", bet.opt_timestamp("expiresAt")?)
            .with("collected_at", collected_at))
    }
}
