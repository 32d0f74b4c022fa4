//! Harvest Ingest
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resilient ingestion of paginated, rate-limited API data into Postgres.
//!
//! # Components
//!
//! - [`client`]: shared rate limiter and retrying HTTP client
//! - [`pagination`]: cursor-driven page sequences
//! - [`gate`]: cheap threshold check before a full pull
//! - [`harvester`]: bounded worker pool over a chunk of subjects
//! - [`source`]: resumable, chunked subject stream
//! - [`writer`]: batch upserts that bisect around bad records
//! - [`store`]: Postgres implementation of the storage traits
//! - [`normalize`]: payload to row mapping for users, bets, contracts and comments
//! - [`pipeline`]: the users, bets, contracts and comments stages

pub mod client;
pub mod config;
pub mod gate;
pub mod harvester;
pub mod normalize;
pub mod pagination;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod writer;

pub use client::{ApiClient, RateLimiter, RetryPolicy};
pub use config::HarvestConfig;
pub use pipeline::{Pipeline, StageReport, Stages};
