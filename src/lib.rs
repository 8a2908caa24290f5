//! Storage Accounting Library
//!
//! Periodic storage-accounting reports for a multi-instance distributed storage service.
//! Project spaces and user homes are listed, enriched with identity, quota and billing
//! charge information from independent external services, aggregated along
//! organizational dimensions and written as tabular reports plus a billing-receiver
//! payload.
//!
//! ## Core Features
//!
//! - **Multi-source join**: identity, quota and charge lookups joined per entity through
//!   explicit map keys
//! - **Bounded concurrency**: identity resolution and charge resolution run on
//!   independently sized pools; charge requests go out one at a time by default
//! - **Partial-failure tolerance**: a failing identity lookup leaves an empty record, while
//!   listing, quota and charge failures abort the run
//! - **Aggregation views**: per charge group, per group and role, per simplified role, and
//!   the schema v3 receiver payload, all sorted by key
//! - **Cost derivation**: flat rate per terabyte of used space
//!
//! ## Architecture Overview
//!
//! - [`models`] - Entity, identity, quota and charge records
//! - [`storage`] - Storage service seam and the `eos` command-line adapter
//! - [`lister`] - Entity listing across instance shards
//! - [`identity`] - Owner id to identity resolution, `getent` and `ldapsearch` adapters
//! - [`quota`] - Per-instance quota dumps merged into an `(account, instance)` index
//! - [`charge`] - Chunked billing classification over HTTP
//! - [`pool`] - Bounded task pools
//! - [`aggregate`] - Join, cleaning, deduplication and aggregation views
//! - [`cost`] - Cost model and currency formatting
//! - [`report`] - Report files and console summary
//! - [`receiver`] - Billing receiver push and report archival
//! - [`pipeline`] - Orchestration of a full run
//! - [`config`] - Configuration management with environment variable support
//! - [`logging`] - Structured logging with JSON and pretty-print formats
//!
//! ## Main Entry Point
//!
//! ```rust,no_run
//! use storage_accounting::{AccountingPipeline, Collaborators, Config, ReportOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let pipeline = AccountingPipeline::new(config.clone(), Collaborators::from_config(&config)?);
//! let summary = pipeline.run(&ReportOptions::from_config(&config)).await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod charge;
pub mod config;
pub mod cost;
pub mod identity;
pub mod lister;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod quota;
pub mod receiver;
pub mod report;
pub mod storage;

pub use aggregate::{AccountingViews, AggregationEngine};
pub use config::Config;
pub use models::*;
pub use pipeline::{AccountingPipeline, Collaborators, PushTarget, ReportOptions, RunSummary};
