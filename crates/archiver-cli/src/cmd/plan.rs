//! `archiver plan`: show the gaps a run would fill for one org, without
//! building anything.

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};
use anyhow::Result;
use archiver_core::config::ArchiverConfig;
use archiver_core::db::{open_metadata, query};
use archiver_core::model::{Archive, ArchiveType, Tenant};
use archiver_core::schedule::{missing_day_archives, missing_month_archives};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use rusqlite::Connection;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Org to plan for.
    #[arg(long, value_name = "ID")]
    pub org: i64,

    /// Only plan this record type (`message` or `run`).
    #[arg(long = "type", value_name = "TYPE")]
    pub archive_type: Option<ArchiveType>,

    /// Plan as if the current time were this RFC 3339 timestamp.
    #[arg(long, value_name = "TIMESTAMP")]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct TypePlan {
    org_id: i64,
    archive_type: ArchiveType,
    horizon: NaiveDate,
    days: Vec<NaiveDate>,
    months: Vec<NaiveDate>,
}

/// Day gaps, then the months those days would complete.
fn plan_type(
    conn: &Connection,
    tenant: &Tenant,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<TypePlan> {
    let existing = query::current_archives(conn, tenant.id, archive_type)?;
    let days = missing_day_archives(&existing, now, tenant, archive_type);

    let mut projected: Vec<Archive> = existing;
    projected.extend(days.iter().cloned());
    let months = missing_month_archives(&projected, now, tenant, archive_type);

    Ok(TypePlan {
        org_id: tenant.id,
        archive_type,
        horizon: tenant.horizon(now),
        days: days.iter().map(|a| a.start_date).collect(),
        months: months.iter().map(|a| a.start_date).collect(),
    })
}

/// # Errors
///
/// Returns an error if the org is unknown or a store cannot be read.
pub fn run_plan(args: &PlanArgs, config: &ArchiverConfig, output: OutputMode) -> Result<()> {
    let records = super::record_store(config);
    let tenant = super::find_tenant(&records, args.org)?;
    let conn = open_metadata(&config.database.metadata_path)?;
    let now = args.now.unwrap_or_else(Utc::now);

    let plans = super::selected_types(config, args.archive_type)
        .into_iter()
        .map(|archive_type| plan_type(&conn, &tenant, archive_type, now))
        .collect::<Result<Vec<_>>>()?;

    render_mode(output, &plans, |p, w| write_text(p, w), |p, w| write_pretty(p, w))
}

fn write_text(plans: &[TypePlan], w: &mut dyn Write) -> io::Result<()> {
    for plan in plans {
        for day in &plan.days {
            writeln!(w, "{}\t{}\tday\t{day}", plan.org_id, plan.archive_type)?;
        }
        for month in &plan.months {
            writeln!(w, "{}\t{}\tmonth\t{month}", plan.org_id, plan.archive_type)?;
        }
    }
    Ok(())
}

/// Collapse consecutive days into `first..last` ranges.
fn day_ranges(days: &[NaiveDate]) -> Vec<String> {
    let mut ranges: Vec<(NaiveDate, NaiveDate)> = Vec::new();
    for &day in days {
        match ranges.last_mut() {
            Some((_, last)) if last.succ_opt() == Some(day) => *last = day,
            _ => ranges.push((day, day)),
        }
    }
    ranges
        .into_iter()
        .map(|(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{first}..{last}")
            }
        })
        .collect()
}

fn write_pretty(plans: &[TypePlan], w: &mut dyn Write) -> io::Result<()> {
    for plan in plans {
        pretty_section(w, &format!("Org {} {}", plan.org_id, plan.archive_type))?;
        pretty_kv(w, "Horizon", plan.horizon.to_string())?;
        pretty_kv(w, "Day gaps", plan.days.len().to_string())?;
        for range in day_ranges(&plan.days) {
            writeln!(w, "  {range}")?;
        }
        pretty_kv(w, "Month gaps", plan.months.len().to_string())?;
        for month in &plan.months {
            writeln!(w, "  {}", month.format("%Y-%m"))?;
        }
        writeln!(w)?;
    }
    Ok(())
}
