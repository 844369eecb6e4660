//! `archiver run`: archive every active tenant up to its horizon.

use crate::output::{OutputMode, human_bytes, pretty_kv, pretty_rule, pretty_section, render_mode};
use crate::signals::cancel_on_signal;
use crate::storage::open_object_store;
use anyhow::{Result, bail};
use archiver_core::config::ArchiverConfig;
use archiver_core::error::ArchiveError;
use archiver_core::lock::RunLock;
use archiver_core::model::Tenant;
use archiver_core::orchestrate::{TenantRunSummary, run_all};
use archiver_core::store::TenantDirectory;
use chrono::{DateTime, Utc};
use clap::Args;
use std::io::{self, Write};
use std::time::Duration;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Archive as if the current time were this RFC 3339 timestamp.
    #[arg(long, value_name = "TIMESTAMP")]
    pub now: Option<DateTime<Utc>>,

    /// Only archive this org.
    #[arg(long, value_name = "ID")]
    pub org: Option<i64>,

    /// Cancel in-flight work after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub deadline_secs: Option<u64>,

    /// How long to wait for another archiver process to finish.
    #[arg(long, value_name = "SECS", default_value = "0")]
    pub lock_timeout_secs: u64,

    /// Override `archive.workers`.
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Restricts a directory to a single org.
struct OnlyOrg<'a> {
    inner: &'a dyn TenantDirectory,
    org_id: i64,
}

impl TenantDirectory for OnlyOrg<'_> {
    fn list_active_tenants(&self) -> Result<Vec<Tenant>, ArchiveError> {
        Ok(self
            .inner
            .list_active_tenants()?
            .into_iter()
            .filter(|t| t.id == self.org_id)
            .collect())
    }
}

/// # Errors
///
/// Returns an error if the run cannot start or any tenant did not finish
/// cleanly.
pub fn run_run(args: &RunArgs, config: &ArchiverConfig, output: OutputMode) -> Result<()> {
    let mut config = config.clone();
    if let Some(workers) = args.workers {
        config.archive.workers = workers;
    }
    let now = args.now.unwrap_or_else(Utc::now);

    let lock = RunLock::acquire(
        &config.lock_path(),
        Duration::from_secs(args.lock_timeout_secs),
    )?;
    let cancel = cancel_on_signal(args.deadline_secs.map(Duration::from_secs))?;
    let records = super::record_store(&config);
    let objects = open_object_store(&config)?;

    let summaries = match args.org {
        Some(org_id) => {
            let only = OnlyOrg {
                inner: &records,
                org_id,
            };
            run_all(&config, &only, &records, objects.as_ref(), now, &cancel)?
        }
        None => run_all(&config, &records, &records, objects.as_ref(), now, &cancel)?,
    };
    lock.release();

    render_summaries(output, &summaries)?;

    let failed = summaries.iter().filter(|s| !s.is_success()).count();
    if summaries.iter().any(TenantRunSummary::cancelled) || cancel.is_cancelled() {
        bail!("run cancelled; committed archives are kept and the next run resumes");
    }
    if failed > 0 {
        bail!("{failed} of {} orgs did not finish archiving", summaries.len());
    }
    Ok(())
}

/// Shared by `run` and `purge`.
pub fn render_summaries(output: OutputMode, summaries: &[TenantRunSummary]) -> Result<()> {
    render_mode(
        output,
        &summaries,
        |s, w| write_text(s, w),
        |s, w| write_pretty(s, w),
    )
}

fn write_text(summaries: &[TenantRunSummary], w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "org\ttype\tdays\tmonths\trecords\tbytes\tpurged\tstatus")?;
    for tenant in summaries {
        for ty in &tenant.types {
            let status = match &ty.first_failure {
                Some(failure) => failure.code.as_str(),
                None if ty.purge_failures > 0 => "purge_pending",
                None => "ok",
            };
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                tenant.org_id,
                ty.archive_type,
                ty.days_created,
                ty.months_created,
                ty.records_archived,
                ty.bytes_uploaded,
                ty.purged,
                status
            )?;
        }
    }
    Ok(())
}

fn write_pretty(summaries: &[TenantRunSummary], w: &mut dyn Write) -> io::Result<()> {
    if summaries.is_empty() {
        return writeln!(w, "No active orgs to archive.");
    }
    for tenant in summaries {
        pretty_section(w, &format!("Org {} ({})", tenant.org_id, tenant.name))?;
        for ty in &tenant.types {
            pretty_kv(
                w,
                ty.archive_type.as_str(),
                format!(
                    "{} days, {} months, {} records, {}",
                    ty.days_created,
                    ty.months_created,
                    ty.records_archived,
                    human_bytes(ty.bytes_uploaded)
                ),
            )?;
            if ty.purged > 0 || ty.purge_failures > 0 {
                pretty_kv(
                    w,
                    "  purged",
                    format!("{} months ({} pending)", ty.purged, ty.purge_failures),
                )?;
            }
            if let Some(failure) = &ty.first_failure {
                let at = match (failure.period, failure.start_date) {
                    (Some(period), Some(start)) => format!("{period} {start}: "),
                    _ => String::new(),
                };
                pretty_kv(w, "  stopped", format!("{at}{}", failure.message))?;
                if let Some(hint) = &failure.hint {
                    pretty_kv(w, "  hint", hint)?;
                }
            }
        }
    }
    pretty_rule(w)
}
