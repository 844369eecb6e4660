//! `archiver init`: create the metadata store, record schema and storage root.

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::{Context as _, Result};
use archiver_core::config::{ArchiverConfig, StorageBackend};
use archiver_core::db::migrations::current_schema_version;
use archiver_core::db::open_metadata;
use clap::Args;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Skip creating the live record schema (when another system owns it).
    #[arg(long)]
    pub no_records: bool,
}

#[derive(Debug, Serialize)]
struct InitReport {
    metadata_path: PathBuf,
    schema_version: u32,
    records_path: Option<PathBuf>,
    storage_root: Option<PathBuf>,
}

/// # Errors
///
/// Returns an error if any store cannot be created.
pub fn run_init(args: &InitArgs, config: &ArchiverConfig, output: OutputMode) -> Result<()> {
    let conn = open_metadata(&config.database.metadata_path)?;
    let schema_version = current_schema_version(&conn).context("Failed to read schema version")?;

    let records_path = if args.no_records {
        None
    } else {
        super::record_store(config)
            .init()
            .with_context(|| {
                format!(
                    "Failed to initialize record store {}",
                    config.database.records_path.display()
                )
            })?;
        Some(config.database.records_path.clone())
    };

    let storage_root = match config.storage.backend {
        StorageBackend::Fs => {
            std::fs::create_dir_all(&config.storage.root).with_context(|| {
                format!("Failed to create storage root {}", config.storage.root.display())
            })?;
            Some(config.storage.root.clone())
        }
        StorageBackend::Http => None,
    };

    let report = InitReport {
        metadata_path: config.database.metadata_path.clone(),
        schema_version,
        records_path,
        storage_root,
    };
    info!(metadata = %report.metadata_path.display(), schema_version, "archiver initialized");

    render_mode(
        output,
        &report,
        |r, w| writeln!(w, "initialized\t{}\tv{}", r.metadata_path.display(), r.schema_version),
        |r, w| {
            pretty_section(w, "Archiver initialized")?;
            pretty_kv(w, "Metadata", r.metadata_path.display().to_string())?;
            pretty_kv(w, "Schema version", r.schema_version.to_string())?;
            if let Some(path) = &r.records_path {
                pretty_kv(w, "Records", path.display().to_string())?;
            }
            if let Some(root) = &r.storage_root {
                pretty_kv(w, "Storage root", root.display().to_string())?;
            }
            Ok(())
        },
    )
}
