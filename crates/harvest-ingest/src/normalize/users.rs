//! `users_clean` rows from `/users` payloads

use chrono::{DateTime, Utc};
use harvest_common::types::{
    ColumnType, NormalizedRecord, PayloadError, RawPayload, TableSchema,
};
use serde_json::Value;

use super::{optional_text, required_text, Normalizer};

pub const USERS_TABLE: &str = "users_clean";

/// Label column used to resume the bets stage
pub const USERNAME_COLUMN: &str = "username";

pub struct UserNormalizer {
    table: TableSchema,
}

impl UserNormalizer {
    pub fn new() -> Self {
        use ColumnType::*;

        let table = TableSchema::new(USERS_TABLE, "id")
            .column(USERNAME_COLUMN, Text)
            .column("name", Text)
            .column("avatar_url", Text)
            .column("bio", Text)
            .column("website", Text)
            .column("banner_url", Text)
            .column("discord_handle", Text)
            .column("twitter_handle", Text)
            .column("created_time", Timestamp)
            .column("last_updated_time", Timestamp)
            .column("last_login", Timestamp)
            .column("sweepstakes_verified_time", Timestamp)
            .column("is_bot", Boolean)
            .column("is_admin", Boolean)
            .column("is_trustworthy", Boolean)
            .column("is_banned", Boolean)
            .column("is_banned_from_mana", Boolean)
            .column("is_banned_from_sweepcash", Boolean)
            .column("is_advanced_trader", Boolean)
            .column("id_verified", Boolean)
            .column("verified_phone", Boolean)
            .column("sweepstakes_verified", Boolean)
            .column("kyc_status", Text)
            .column("referred_by_user_id", Text)
            .column("total_profit", Double)
            .column("total_volume", Double)
            .column("current_betting_streak", BigInt)
            .column("follower_count", BigInt)
            .column("creator_traders", Jsonb)
            .column("next_loan_cached", Double)
            .column("resolved_profit_adjustment", Double)
            .column("balance", Double)
            .column("cash_balance", Double)
            .column("spice_balance", Double)
            .column("total_deposits", Double)
            .column("total_cash_deposits", Double)
            .column("url", Text)
            .column("collected_at", Timestamp);

        Self { table }
    }
}

impl Default for UserNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer for UserNormalizer {
    fn table(&self) -> &TableSchema {
        &self.table
    }

    fn normalize(
        &self,
        user: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<NormalizedRecord, PayloadError> {
        let name = match optional_text(user, "name")? {
            Some(name) => name,
            None => required_text(user, "displayName").map_err(|_| PayloadError::Missing {
                field: "name".to_string(),
            })?,
        };
        let creator_traders = Value::Object(user.get_object("creatorTraders")?.clone());
        let profit = RawPayload::new(user.opt_object("profitCached")?.cloned().unwrap_or_default());

        Ok(NormalizedRecord::new(required_text(user, "id")?)
            .with(USERNAME_COLUMN, required_text(user, "username")?)
            .with("name", name)
            .with("avatar_url", optional_text(user, "avatarUrl")?)
            .with("bio", optional_text(user, "bio")?)
            .with("website", optional_text(user, "website")?)
            .with("banner_url", optional_text(user, "bannerUrl")?)
            .with("discord_handle", optional_text(user, "discordHandle")?)
            .with("twitter_handle", optional_text(user, "twitterHandle")?)
            .with("created_time", user.get_timestamp("createdTime")?)
            .with("last_updated_time", user.opt_timestamp("lastUpdatedTime")?)
            .with("last_login", user.opt_timestamp("lastBetTime")?)
            .with("sweepstakes_verified_time", user.opt_timestamp("sweepstakesVerifiedTime")?)
            .with("is_bot", user.opt_bool("isBot")?.unwrap_or(false))
            .with("is_admin", user.opt_bool("isAdmin")?.unwrap_or(false))
            .with("is_trustworthy", user.opt_bool("isTrustworthy")?.unwrap_or(false))
            .with("is_banned", user.opt_bool("isBanned")?)
            .with("is_banned_from_mana", user.opt_bool("isBannedFromMana")?)
            .with("is_banned_from_sweepcash", user.opt_bool("isBannedFromSweepcash")?)
            .with("is_advanced_trader", user.opt_bool("isAdvancedTrader")?)
            .with("id_verified", user.opt_bool("idVerified")?)
            .with("verified_phone", user.opt_bool("verifiedPhone")?)
            .with("sweepstakes_verified", user.opt_bool("sweepstakesVerified")?)
            .with("kyc_status", optional_text(user, "kycDocumentStatus")?)
            .with("referred_by_user_id", optional_text(user, "referredByUserId")?)
            .with("total_profit", profit.opt_f64("allTime")?)
            .with("total_volume", profit.opt_f64("sinceCreation")?)
            .with("current_betting_streak", user.opt_i64("currentBettingStreak")?)
            .with("follower_count", user.opt_i64("followerCountCached")?)
            .with("creator_traders", creator_traders)
            .with("next_loan_cached", user.opt_f64("nextLoanCached")?)
            .with("resolved_profit_adjustment", user.opt_f64("resolvedProfitAdjustment")?)
            .with("balance", user.get_f64("balance")?)
            .with("cash_balance", user.opt_f64("cashBalance")?)
            .with("spice_balance", user.opt_f64("spiceBalance")?)
            .with("total_deposits", user.get_f64("totalDeposits")?)
            .with("total_cash_deposits", user.opt_f64("totalCashDeposits")?)
            .with("url", optional_text(user, "url")?)
            .with("collected_at", collected_at))
    }
}
