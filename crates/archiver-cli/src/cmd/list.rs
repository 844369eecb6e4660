//! `archiver list`: current archives for one org.

use crate::output::{OutputMode, Renderable, human_bytes, pretty_kv, render_list};
use anyhow::Result;
use archiver_core::config::ArchiverConfig;
use archiver_core::db::{open_metadata, query};
use archiver_core::model::{Archive, ArchiveState, ArchiveType, Period};
use chrono::NaiveDate;
use clap::Args;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Org whose archives to list.
    #[arg(long, value_name = "ID")]
    pub org: i64,

    /// Only list this record type (`message` or `run`).
    #[arg(long = "type", value_name = "TYPE")]
    pub archive_type: Option<ArchiveType>,

    /// Only list this period (`day` or `month`).
    #[arg(long)]
    pub period: Option<Period>,
}

#[derive(Debug, Serialize)]
struct ArchiveRow {
    id: Option<i64>,
    archive_type: ArchiveType,
    period: Period,
    start_date: NaiveDate,
    state: ArchiveState,
    record_count: u64,
    size: u64,
    hash: String,
    url: String,
    rollup_id: Option<i64>,
}

impl From<Archive> for ArchiveRow {
    fn from(archive: Archive) -> Self {
        Self {
            id: archive.id,
            archive_type: archive.archive_type,
            period: archive.period,
            state: archive.state(),
            start_date: archive.start_date,
            record_count: archive.record_count,
            size: archive.size,
            hash: archive.hash,
            url: archive.url,
            rollup_id: archive.rollup_id,
        }
    }
}

impl Renderable for ArchiveRow {
    fn render_human(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "{} {} {} [{}]",
            self.archive_type, self.period, self.start_date, self.state
        )?;
        pretty_kv(
            w,
            "  records",
            format!("{} ({})", self.record_count, human_bytes(self.size)),
        )?;
        pretty_kv(w, "  url", &self.url)?;
        if let Some(rollup) = self.rollup_id {
            pretty_kv(w, "  rollup", format!("#{rollup}"))?;
        }
        Ok(())
    }

    fn render_table(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.id.unwrap_or_default(),
            self.archive_type,
            self.period,
            self.start_date,
            self.state,
            self.record_count,
            self.size,
            self.url
        )
    }

    fn table_headers() -> &'static [&'static str] {
        &["id", "type", "period", "start", "state", "records", "size", "url"]
    }
}

/// # Errors
///
/// Returns an error if the metadata store cannot be read.
pub fn run_list(args: &ListArgs, config: &ArchiverConfig, output: OutputMode) -> Result<()> {
    let conn = open_metadata(&config.database.metadata_path)?;
    let mut rows = Vec::new();
    for archive_type in super::selected_types(config, args.archive_type) {
        rows.extend(
            query::current_archives(&conn, args.org, archive_type)?
                .into_iter()
                .filter(|a| args.period.is_none_or(|p| a.period == p))
                .map(ArchiveRow::from),
        );
    }
    render_list(&rows, output)
}
