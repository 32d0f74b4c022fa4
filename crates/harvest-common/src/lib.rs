//! Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the harvest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`HarvestError`] taxonomy shared by the client,
//!   the harvester and the batch writer
//! - **Types**: subjects, raw payloads and normalized records
//! - **Logging**: `tracing` subscriber setup for console and rolling files
//!
//! # Example
//!
//! ```no_run
//! use harvest_common::types::RawPayload;
//! use harvest_common::Result;
//!
//! fn cursor_of(payload: &RawPayload) -> Result<String> {
//!     Ok(payload.get_str("id")?.to_string())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{HarvestError, Result};
