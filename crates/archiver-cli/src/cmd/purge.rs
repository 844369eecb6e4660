//! `archiver purge`: retry source deletion for archived months whose purge
//! did not complete. Nothing new is archived.

use crate::output::OutputMode;
use crate::signals::cancel_on_signal;
use crate::storage::open_object_store;
use anyhow::{Result, bail};
use archiver_core::config::ArchiverConfig;
use archiver_core::lock::RunLock;
use archiver_core::orchestrate::purge_all;
use clap::Args;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// How long to wait for another archiver process to finish.
    #[arg(long, value_name = "SECS", default_value = "0")]
    pub lock_timeout_secs: u64,
}

/// # Errors
///
/// Returns an error if deletion is disabled, the run cannot start, or any
/// purge is still pending afterwards.
pub fn run_purge(args: &PurgeArgs, config: &ArchiverConfig, output: OutputMode) -> Result<()> {
    if !config.archive.delete {
        bail!("archive.delete is disabled; enable it (or set ARCHIVER_DELETE=true) to purge");
    }

    let lock = RunLock::acquire(
        &config.lock_path(),
        Duration::from_secs(args.lock_timeout_secs),
    )?;
    let cancel = cancel_on_signal(None)?;
    let records = super::record_store(config);
    let objects = open_object_store(config)?;

    let summaries = purge_all(config, &records, &records, objects.as_ref(), &cancel)?;
    lock.release();

    let purged: usize = summaries.iter().flat_map(|s| &s.types).map(|t| t.purged).sum();
    let pending: usize = summaries
        .iter()
        .flat_map(|s| &s.types)
        .map(|t| t.purge_failures + usize::from(t.first_failure.is_some()))
        .sum();
    info!(purged, pending, "purge finished");

    super::run::render_summaries(output, &summaries)?;
    if pending > 0 {
        bail!("{pending} purges are still pending");
    }
    Ok(())
}
