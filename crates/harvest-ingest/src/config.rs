//! Harvest configuration
//!
//! Loaded from environment variables (a `.env` file is read first by the
//! binary). Every setting has a default below except `DATABASE_URL`.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::client::{RetryPolicy, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 7;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.75;
/// 500 requests per minute
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 120;

pub const DEFAULT_USER_PAGE_SIZE: usize = 500;
pub const DEFAULT_USER_CHUNK_SIZE: usize = 200;

pub const DEFAULT_BET_PAGE_SIZE: usize = 1000;
pub const DEFAULT_BET_THRESHOLD: usize = 50;
pub const DEFAULT_BET_WORKER_COUNT: usize = 4;
pub const DEFAULT_BET_USER_CHUNK_SIZE: usize = 500;
/// Postgres caps a statement at 65535 bind parameters
pub const DEFAULT_MAX_PARAMS_PER_STATEMENT: usize = 60_000;

pub const DEFAULT_CONTRACT_USER_LIMIT: usize = 25;
pub const DEFAULT_CONTRACT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_COMMENT_USER_LIMIT: usize = 25;
pub const DEFAULT_COMMENT_PAGE_SIZE: usize = 1000;

/// Parse `name` if set, else use `default`. A value that does not parse is an
/// error rather than a silent fallback.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        _ => Ok(default),
    }
}

fn env_opt<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Remote API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Attempts per logical request
    pub max_retries: u32,
    pub backoff_factor: f64,
    /// Minimum spacing between requests, shared by all workers
    pub min_interval_ms: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_factor)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsersStageConfig {
    pub page_size: usize,
    /// Users normalized and written per batch
    pub chunk_size: usize,
    /// Stop after this many users
    pub limit: Option<usize>,
    /// Bind-parameter budget per insert statement; 0 disables pre-splitting
    pub max_params_per_statement: usize,
}

impl Default for UsersStageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_USER_PAGE_SIZE,
            chunk_size: DEFAULT_USER_CHUNK_SIZE,
            limit: None,
            max_params_per_statement: DEFAULT_MAX_PARAMS_PER_STATEMENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BetsStageConfig {
    pub page_size: usize,
    /// Minimum bet count for a user's full history to be pulled
    pub threshold: usize,
    pub worker_count: usize,
    /// Users read from the store per harvesting pass
    pub user_chunk_size: usize,
    /// Bind-parameter budget per insert statement; 0 disables pre-splitting
    pub max_params_per_statement: usize,
}

impl Default for BetsStageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_BET_PAGE_SIZE,
            threshold: DEFAULT_BET_THRESHOLD,
            worker_count: DEFAULT_BET_WORKER_COUNT,
            user_chunk_size: DEFAULT_BET_USER_CHUNK_SIZE,
            max_params_per_statement: DEFAULT_MAX_PARAMS_PER_STATEMENT,
        }
    }
}

/// Settings for a stage that refreshes one endpoint for the most active
/// bettors (contracts, comments)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopUsersStageConfig {
    /// Users selected by stored bet count; 0 skips the stage
    pub user_limit: usize,
    pub page_size: usize,
    /// Bind-parameter budget per insert statement; 0 disables pre-splitting
    pub max_params_per_statement: usize,
}

impl TopUsersStageConfig {
    pub fn contracts() -> Self {
        Self {
            user_limit: DEFAULT_CONTRACT_USER_LIMIT,
            page_size: DEFAULT_CONTRACT_PAGE_SIZE,
            max_params_per_statement: DEFAULT_MAX_PARAMS_PER_STATEMENT,
        }
    }

    pub fn comments() -> Self {
        Self {
            user_limit: DEFAULT_COMMENT_USER_LIMIT,
            page_size: DEFAULT_COMMENT_PAGE_SIZE,
            max_params_per_statement: DEFAULT_MAX_PARAMS_PER_STATEMENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub users: UsersStageConfig,
    pub bets: BetsStageConfig,
    pub contracts: TopUsersStageConfig,
    pub comments: TopUsersStageConfig,
}

impl HarvestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let config = Self {
            database: DatabaseConfig {
                url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            },
            api: ApiConfig {
                base_url: env_or("MANIFOLD_API_URL", DEFAULT_BASE_URL.to_string())?,
                api_key: env_opt("MANIFOLD_API_KEY")?,
                timeout_secs: env_or("API_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
                max_retries: env_or("API_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                backoff_factor: env_or("API_BACKOFF_FACTOR", DEFAULT_BACKOFF_FACTOR)?,
                min_interval_ms: env_or("API_MIN_INTERVAL_MS", DEFAULT_MIN_INTERVAL_MS)?,
            },
            users: UsersStageConfig {
                page_size: env_or("USER_PAGE_SIZE", DEFAULT_USER_PAGE_SIZE)?,
                chunk_size: env_or("USER_CHUNK_SIZE", DEFAULT_USER_CHUNK_SIZE)?,
                limit: env_opt("USER_LIMIT")?,
                max_params_per_statement: env_or(
                    "USER_MAX_PARAMS_PER_STATEMENT",
                    DEFAULT_MAX_PARAMS_PER_STATEMENT,
                )?,
            },
            bets: BetsStageConfig {
                page_size: env_or("BET_PAGE_SIZE", DEFAULT_BET_PAGE_SIZE)?,
                threshold: env_or("BET_THRESHOLD", DEFAULT_BET_THRESHOLD)?,
                worker_count: env_or("BET_WORKER_COUNT", DEFAULT_BET_WORKER_COUNT)?,
                user_chunk_size: env_or("BET_USER_CHUNK_SIZE", DEFAULT_BET_USER_CHUNK_SIZE)?,
                max_params_per_statement: env_or(
                    "BET_MAX_PARAMS_PER_STATEMENT",
                    DEFAULT_MAX_PARAMS_PER_STATEMENT,
                )?,
            },
            contracts: TopUsersStageConfig {
                user_limit: env_or("CONTRACT_USER_LIMIT", DEFAULT_CONTRACT_USER_LIMIT)?,
                page_size: env_or("CONTRACT_PAGE_SIZE", DEFAULT_CONTRACT_PAGE_SIZE)?,
                max_params_per_statement: env_or(
                    "CONTRACT_MAX_PARAMS_PER_STATEMENT",
                    DEFAULT_MAX_PARAMS_PER_STATEMENT,
                )?,
            },
            comments: TopUsersStageConfig {
                user_limit: env_or("COMMENT_USER_LIMIT", DEFAULT_COMMENT_USER_LIMIT)?,
                page_size: env_or("COMMENT_PAGE_SIZE", DEFAULT_COMMENT_PAGE_SIZE)?,
                max_params_per_statement: env_or(
                    "COMMENT_MAX_PARAMS_PER_STATEMENT",
                    DEFAULT_MAX_PARAMS_PER_STATEMENT,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            bail!("DATABASE_URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        if self.api.base_url.is_empty() {
            bail!("MANIFOLD_API_URL cannot be empty");
        }
        if self.api.timeout_secs == 0 {
            bail!("API_TIMEOUT_SECS must be greater than 0");
        }
        if self.api.max_retries == 0 {
            bail!("API_MAX_RETRIES must be at least 1");
        }
        if !self.api.backoff_factor.is_finite() || self.api.backoff_factor < 1.0 {
            bail!(
                "API_BACKOFF_FACTOR must be a finite number >= 1, got {}",
                self.api.backoff_factor
            );
        }
        if self.users.page_size == 0 {
            bail!("USER_PAGE_SIZE must be greater than 0");
        }
        if self.users.chunk_size == 0 {
            bail!("USER_CHUNK_SIZE must be greater than 0");
        }
        if self.bets.page_size == 0 {
            bail!("BET_PAGE_SIZE must be greater than 0");
        }
        if self.bets.worker_count == 0 {
            bail!("BET_WORKER_COUNT must be greater than 0");
        }
        if self.bets.user_chunk_size == 0 {
            bail!("BET_USER_CHUNK_SIZE must be greater than 0");
        }
        if self.contracts.page_size == 0 {
            bail!("CONTRACT_PAGE_SIZE must be greater than 0");
        }
        if self.comments.page_size == 0 {
            bail!("COMMENT_PAGE_SIZE must be greater than 0");
        }
        Ok(())
    }
}
