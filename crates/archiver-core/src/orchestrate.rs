//! Per-tenant archival runs.
//!
//! For each tenant and enabled record type, in order:
//!
//! 1. retry purges left pending by earlier runs,
//! 2. build, upload, and persist every missing day, oldest first,
//! 3. re-read the timeline and build, upload, and consolidate every month
//!    whose days are now complete,
//! 4. purge source records for those months when the tenant does not
//!    retain them.
//!
//! The first unrecoverable error stops that tenant/type; whatever was
//! committed before it stays committed and the next run resumes from the
//! gaps. Tenants are independent and run on a bounded worker pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam::queue::SegQueue;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, debug_span, error, info, info_span, warn};

use crate::build::ArtifactBuilder;
use crate::cancel::CancelToken;
use crate::config::ArchiverConfig;
use crate::db::rollup::RollupCoordinator;
use crate::db::{open_metadata, touch_last_run};
use crate::error::ArchiveError;
use crate::model::{Archive, ArchiveType, Period, Tenant};
use crate::retry::RetryPolicy;
use crate::schedule;
use crate::store::{ObjectStore, RecordStore, TenantDirectory};

/// Deletes a local build file when dropped, whatever happened to the task.
#[derive(Debug)]
pub struct LocalArtifactGuard {
    path: Option<PathBuf>,
}

impl LocalArtifactGuard {
    #[must_use]
    pub const fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for LocalArtifactGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "local artifact removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove local artifact"),
        }
    }
}

/// The first error that stopped a tenant/type run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub period: Option<Period>,
    pub start_date: Option<NaiveDate>,
    pub code: String,
    pub message: String,
    pub hint: Option<String>,
}

/// Outcome of archiving one record type for one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TypeRunSummary {
    pub org_id: i64,
    pub archive_type: ArchiveType,
    pub days_created: usize,
    pub months_created: usize,
    pub rollups_linked: usize,
    pub records_archived: u64,
    pub bytes_uploaded: u64,
    pub purged: usize,
    pub purge_failures: usize,
    pub cancelled: bool,
    pub first_failure: Option<RunFailure>,
    /// Archives committed during this run, in commit order.
    #[serde(skip)]
    pub created: Vec<Archive>,
}

impl TypeRunSummary {
    #[must_use]
    pub const fn new(org_id: i64, archive_type: ArchiveType) -> Self {
        Self {
            org_id,
            archive_type,
            days_created: 0,
            months_created: 0,
            rollups_linked: 0,
            records_archived: 0,
            bytes_uploaded: 0,
            purged: 0,
            purge_failures: 0,
            cancelled: false,
            first_failure: None,
            created: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.first_failure.is_none()
    }

    fn record_created(&mut self, archive: &Archive) {
        match archive.period {
            Period::Day => self.days_created += 1,
            Period::Month => self.months_created += 1,
        }
        self.records_archived += archive.record_count;
        self.bytes_uploaded += archive.size;
        self.created.push(archive.clone());
    }

    fn record_failure(&mut self, failure: TaskError) {
        self.cancelled |= failure.error.is_cancelled();
        if self.first_failure.is_none() {
            self.first_failure = Some(RunFailure {
                period: failure.period,
                start_date: failure.start_date,
                code: failure.error.code().code().to_string(),
                message: failure.error.to_string(),
                hint: failure.error.hint().map(ToString::to_string),
            });
        }
    }
}

/// Outcome of archiving every enabled type for one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TenantRunSummary {
    pub org_id: i64,
    pub name: String,
    pub types: Vec<TypeRunSummary>,
}

impl TenantRunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.types.iter().all(TypeRunSummary::is_success)
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.types.iter().any(|t| t.cancelled)
    }
}

/// An error tagged with the task it interrupted, if any.
struct TaskError {
    period: Option<Period>,
    start_date: Option<NaiveDate>,
    error: ArchiveError,
}

impl TaskError {
    fn at(task: &Archive, error: ArchiveError) -> Self {
        Self {
            period: Some(task.period),
            start_date: Some(task.start_date),
            error,
        }
    }

    const fn untargeted(error: ArchiveError) -> Self {
        Self {
            period: None,
            start_date: None,
            error,
        }
    }
}

/// Drives the archival phases for tenants against one metadata connection.
pub struct Orchestrator<'a> {
    config: &'a ArchiverConfig,
    coordinator: RollupCoordinator<'a>,
    records: &'a dyn RecordStore,
    objects: &'a dyn ObjectStore,
    builder: ArtifactBuilder,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    /// # Errors
    ///
    /// Returns an error if the configured temp directory cannot be created.
    pub fn new(
        config: &'a ArchiverConfig,
        conn: &'a Connection,
        records: &'a dyn RecordStore,
        objects: &'a dyn ObjectStore,
        cancel: CancelToken,
    ) -> Result<Self, ArchiveError> {
        let builder =
            ArtifactBuilder::new(&config.archive.temp_dir, config.archive.compression_level)?;
        Ok(Self {
            config,
            coordinator: RollupCoordinator::new(conn),
            records,
            objects,
            builder,
            retry: config.retry.policy(),
            cancel,
        })
    }

    #[must_use]
    pub const fn coordinator(&self) -> &RollupCoordinator<'a> {
        &self.coordinator
    }

    /// Archive every enabled record type for `tenant` as of `now`.
    #[must_use]
    pub fn archive_tenant(&self, tenant: &Tenant, now: DateTime<Utc>) -> TenantRunSummary {
        let span = info_span!("tenant", org_id = tenant.id, name = %tenant.name);
        let _enter = span.enter();

        let mut types = Vec::new();
        for archive_type in self.config.enabled_types() {
            types.push(self.archive_tenant_type(tenant, archive_type, now));
            if self.cancel.is_cancelled() {
                break;
            }
        }
        TenantRunSummary {
            org_id: tenant.id,
            name: tenant.name.clone(),
            types,
        }
    }

    /// Archive one record type for `tenant`. Errors are folded into the
    /// returned summary rather than propagated.
    #[must_use]
    pub fn archive_tenant_type(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        now: DateTime<Utc>,
    ) -> TypeRunSummary {
        let span = info_span!("archive_type", archive_type = %archive_type);
        let _enter = span.enter();

        let mut summary = TypeRunSummary::new(tenant.id, archive_type);
        if let Err(err) = self.retry_pending_purges(tenant, archive_type, &mut summary) {
            warn!(error = %err, "pending purge lookup failed");
            summary.purge_failures += 1;
        }

        if let Err(failure) = self.run_phases(tenant, archive_type, now, &mut summary) {
            if failure.error.is_cancelled() {
                warn!(
                    period = ?failure.period,
                    start = ?failure.start_date,
                    "archival cancelled"
                );
            } else {
                error!(
                    period = ?failure.period,
                    start = ?failure.start_date,
                    code = %failure.error.code(),
                    error = %failure.error,
                    "archival stopped"
                );
            }
            summary.record_failure(failure);
        }

        info!(
            days_created = summary.days_created,
            months_created = summary.months_created,
            records_archived = summary.records_archived,
            purged = summary.purged,
            success = summary.is_success(),
            "tenant archival finished"
        );
        summary
    }

    /// Retry source deletion for months committed by earlier runs whose
    /// purge did not complete.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending months cannot be listed; purge
    /// failures are counted in `summary`.
    pub fn retry_pending_purges(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        summary: &mut TypeRunSummary,
    ) -> Result<(), ArchiveError> {
        if !self.purge_enabled(tenant) {
            return Ok(());
        }

        for mut month in self.coordinator.pending_purges(tenant.id, archive_type)? {
            let Some(month_id) = month.id else {
                continue;
            };
            let mut dailies = self.coordinator.rollup_members(month_id)?;
            info!(archive = %month, "retrying pending purge");
            match self.purge_month(tenant, &mut month, &mut dailies) {
                Ok(_) => summary.purged += 1,
                Err(err) => {
                    warn!(archive = %month, error = %err, "purge failed; will retry next run");
                    summary.purge_failures += 1;
                }
            }
        }
        Ok(())
    }

    fn purge_enabled(&self, tenant: &Tenant) -> bool {
        self.config.archive.delete && tenant.needs_deletion()
    }

    fn run_phases(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        now: DateTime<Utc>,
        summary: &mut TypeRunSummary,
    ) -> Result<(), TaskError> {
        let existing = self
            .coordinator
            .current_archives(tenant.id, archive_type)
            .map_err(TaskError::untargeted)?;
        let days = schedule::missing_day_archives(&existing, now, tenant, archive_type);
        debug!(tasks = days.len(), "day gaps scheduled");

        for mut task in days {
            self.cancel.check().map_err(|e| TaskError::at(&task, e))?;
            self.process_day(tenant, &mut task)
                .map_err(|e| TaskError::at(&task, e))?;
            summary.record_created(&task);
        }

        let existing = self
            .coordinator
            .current_archives(tenant.id, archive_type)
            .map_err(TaskError::untargeted)?;
        let months = schedule::missing_month_archives(&existing, now, tenant, archive_type);
        debug!(tasks = months.len(), "month gaps scheduled");

        for mut month in months {
            self.cancel.check().map_err(|e| TaskError::at(&month, e))?;
            let mut dailies = schedule::dailies_for_month(&existing, &month);
            self.process_month(tenant, &mut month, &mut dailies, summary)
                .map_err(|e| TaskError::at(&month, e))?;
        }
        Ok(())
    }

    fn process_day(&self, tenant: &Tenant, task: &mut Archive) -> Result<(), ArchiveError> {
        let span = debug_span!("day", start = %task.start_date);
        let _enter = span.enter();

        self.build_and_upload(tenant, task)?;
        self.retry
            .run("persist archive", &self.cancel, || self.coordinator.persist(&mut *task))?;
        Ok(())
    }

    fn process_month(
        &self,
        tenant: &Tenant,
        month: &mut Archive,
        dailies: &mut [Archive],
        summary: &mut TypeRunSummary,
    ) -> Result<(), ArchiveError> {
        let span = debug_span!("month", start = %month.start_date);
        let _enter = span.enter();

        self.build_and_upload(tenant, month)?;
        let earliest = tenant.earliest_day();
        self.retry.run("consolidate month", &self.cancel, || {
            self.coordinator
                .consolidate(&mut *month, &mut *dailies, earliest)
        })?;
        summary.record_created(month);
        summary.rollups_linked += dailies.len();

        if self.purge_enabled(tenant) {
            match self.purge_month(tenant, month, dailies) {
                Ok(_) => summary.purged += 1,
                Err(err) => {
                    warn!(archive = %month, error = %err, "purge failed; will retry next run");
                    summary.purge_failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Build the artifact, upload it, and delete the local file whatever the
    /// outcome.
    fn build_and_upload(&self, tenant: &Tenant, task: &mut Archive) -> Result<(), ArchiveError> {
        self.retry.run("build artifact", &self.cancel, || {
            self.builder
                .build(&mut *task, tenant, self.records, &self.cancel)
        })?;

        let guard = LocalArtifactGuard::new(task.local_path.clone());
        let Some(path) = guard.path() else {
            return Err(ArchiveError::consistency(
                crate::error::ErrorCode::InternalUnexpected,
                task,
                "built archive has no local artifact",
            ));
        };
        let key = task.object_key();
        let url = self.retry.run("upload artifact", &self.cancel, || {
            self.objects
                .put_object(&key, path, &self.config.storage.content_type)
        })?;
        task.mark_uploaded(url)?;
        drop(guard);
        task.clear_local_path();

        debug!(archive = %task, url = %task.url, "artifact uploaded");
        Ok(())
    }

    /// Verify the month's object is stored, delete its source records, and
    /// mark it and its days purged. The archive itself is never rolled back.
    fn purge_month(
        &self,
        tenant: &Tenant,
        month: &mut Archive,
        dailies: &mut [Archive],
    ) -> Result<u64, ArchiveError> {
        let key = month.object_key();
        let exists = self
            .retry
            .run("verify object", &self.cancel, || self.objects.object_exists(&key));
        match exists {
            Ok(true) => {}
            Ok(false) => {
                return Err(ArchiveError::purge(
                    month,
                    ArchiveError::Store(format!("object {key} is missing from storage")),
                ));
            }
            Err(err) => return Err(ArchiveError::purge(month, err)),
        }

        let range = month.time_range();
        let archive_type = month.archive_type;
        let deleted = self
            .retry
            .run("delete records", &self.cancel, || {
                self.records.delete_records(tenant, archive_type, &range)
            })
            .map_err(|err| ArchiveError::purge(month, err))?;

        let marked = self.retry.run("mark purged", &self.cancel, || {
            self.coordinator
                .mark_month_purged(&mut *month, &mut *dailies)
        });
        if let Err(err) = marked {
            return Err(ArchiveError::purge(month, err));
        }

        info!(archive = %month, deleted, days = dailies.len(), "source records purged");
        Ok(deleted)
    }
}

/// Archive every active tenant as of `now` on a bounded worker pool.
///
/// Each worker opens its own metadata connection; the schema is migrated
/// once up front. Returns one summary per tenant, ordered by tenant id.
///
/// # Errors
///
/// Returns an error if the tenant list cannot be read, the metadata store
/// cannot be opened, or a worker panics.
pub fn run_all(
    config: &ArchiverConfig,
    directory: &dyn TenantDirectory,
    records: &dyn RecordStore,
    objects: &dyn ObjectStore,
    now: DateTime<Utc>,
    cancel: &CancelToken,
) -> anyhow::Result<Vec<TenantRunSummary>> {
    let metadata_path = &config.database.metadata_path;
    let main_conn = open_metadata(metadata_path)?;

    let tenants = directory
        .list_active_tenants()
        .context("list active tenants")?;
    let tenant_count = tenants.len();
    let queue = SegQueue::new();
    for tenant in tenants {
        queue.push(tenant);
    }
    let workers = config.archive.workers.clamp(1, tenant_count.max(1));
    info!(tenants = tenant_count, workers, %now, "archival run starting");

    let mut summaries = std::thread::scope(|scope| -> anyhow::Result<Vec<TenantRunSummary>> {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = &queue;
                scope.spawn(move || -> anyhow::Result<Vec<TenantRunSummary>> {
                    let conn = open_metadata(metadata_path)
                        .with_context(|| format!("worker {worker}: open metadata store"))?;
                    let orchestrator =
                        Orchestrator::new(config, &conn, records, objects, cancel.clone())
                            .with_context(|| format!("worker {worker}: prepare temp dir"))?;

                    let mut done = Vec::new();
                    while let Some(tenant) = queue.pop() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        done.push(orchestrator.archive_tenant(&tenant, now));
                    }
                    Ok(done)
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let done = handle
                .join()
                .map_err(|_| anyhow!("archiver worker panicked"))??;
            all.extend(done);
        }
        Ok(all)
    })?;
    summaries.sort_by_key(|s| s.org_id);

    touch_last_run(&main_conn, Utc::now().timestamp_micros()).context("record run completion")?;
    info!(
        tenants = summaries.len(),
        failed = summaries.iter().filter(|s| !s.is_success()).count(),
        "archival run finished"
    );
    Ok(summaries)
}

/// Retry pending purges for every active tenant without archiving anything
/// new.
///
/// # Errors
///
/// Returns an error if the tenant list or metadata store is unavailable.
pub fn purge_all(
    config: &ArchiverConfig,
    directory: &dyn TenantDirectory,
    records: &dyn RecordStore,
    objects: &dyn ObjectStore,
    cancel: &CancelToken,
) -> anyhow::Result<Vec<TenantRunSummary>> {
    let conn = open_metadata(&config.database.metadata_path)?;
    let orchestrator = Orchestrator::new(config, &conn, records, objects, cancel.clone())?;
    let tenants = directory
        .list_active_tenants()
        .context("list active tenants")?;

    let mut summaries = Vec::new();
    for tenant in tenants {
        if cancel.is_cancelled() {
            break;
        }
        let mut types = Vec::new();
        for archive_type in config.enabled_types() {
            let mut summary = TypeRunSummary::new(tenant.id, archive_type);
            if let Err(err) = orchestrator.retry_pending_purges(&tenant, archive_type, &mut summary)
            {
                summary.record_failure(TaskError::untargeted(err));
            }
            types.push(summary);
        }
        summaries.push(TenantRunSummary {
            org_id: tenant.id,
            name: tenant.name.clone(),
            types,
        });
    }
    Ok(summaries)
}
