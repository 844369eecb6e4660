pub mod init;
pub mod list;
pub mod plan;
pub mod purge;
pub mod run;

use anyhow::{Context as _, Result};
use archiver_core::config::ArchiverConfig;
use archiver_core::model::{ArchiveType, Tenant};
use archiver_core::store::TenantDirectory;
use archiver_core::store::sqlite::SqliteRecordStore;

/// The live record store named by `config.database.records_path`.
pub fn record_store(config: &ArchiverConfig) -> SqliteRecordStore {
    SqliteRecordStore::new(&config.database.records_path, config.archive.active_days)
}

/// Look up one active tenant by id.
pub fn find_tenant(directory: &dyn TenantDirectory, org_id: i64) -> Result<Tenant> {
    directory
        .list_active_tenants()
        .context("Failed to list tenants")?
        .into_iter()
        .find(|t| t.id == org_id)
        .with_context(|| format!("org {org_id} not found or not active"))
}

/// `--type` value, or every type enabled in config.
pub fn selected_types(config: &ArchiverConfig, only: Option<ArchiveType>) -> Vec<ArchiveType> {
    only.map_or_else(|| config.enabled_types(), |t| vec![t])
}
