//! archiver-core library.
//!
//! Cold-storage archival of per-tenant message and run records: gap
//! scheduling over a tenant's archive timeline, streamed artifact
//! construction, and the rollup bookkeeping that consolidates daily
//! archives into monthly ones.
//!
//! # Conventions
//!
//! - **Errors**: library operations return [`error::ArchiveError`]; config and
//!   bootstrap glue uses `anyhow::Result`.
//! - **Logging**: use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod build;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod model;
pub mod orchestrate;
pub mod retry;
pub mod schedule;
pub mod store;
