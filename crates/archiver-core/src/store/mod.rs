//! Collaborator seams: the live record store, the tenant directory, and
//! object storage.
//!
//! The orchestrator only talks to these traits, so tests and alternative
//! deployments can swap any of them.

pub mod fs;
pub mod sqlite;

use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::ArchiveError;
use crate::model::{ArchiveType, Record, Tenant, TimeRange};

/// Receives records one at a time while a period is streamed.
pub type RecordSink<'a> = dyn FnMut(Record) -> Result<(), ArchiveError> + 'a;

/// Source of live tenant records.
pub trait RecordStore: Send + Sync {
    /// Push every record of `archive_type` for `tenant` in `range` into
    /// `sink`, in extraction order, and return how many were pushed.
    ///
    /// Implementations check `cancel` at least once per record. A sink error
    /// stops the stream and is returned unchanged.
    ///
    /// # Errors
    ///
    /// Connectivity failures are transient; malformed rows are not.
    fn stream_records(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        range: &TimeRange,
        cancel: &CancelToken,
        sink: &mut RecordSink<'_>,
    ) -> Result<u64, ArchiveError>;

    /// Delete every record of `archive_type` for `tenant` in `range`.
    ///
    /// # Errors
    ///
    /// Fails with a transient error on connection loss; nothing is deleted
    /// on failure.
    fn delete_records(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        range: &TimeRange,
    ) -> Result<u64, ArchiveError>;
}

/// Lists the tenants eligible for archival.
pub trait TenantDirectory: Send + Sync {
    /// Active tenants ordered by id.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be read.
    fn list_active_tenants(&self) -> Result<Vec<Tenant>, ArchiveError>;
}

/// Durable storage for finished artifacts.
pub trait ObjectStore: Send + Sync {
    /// Upload `file` under `key`, replacing any previous object, and return
    /// its URL.
    ///
    /// # Errors
    ///
    /// Connectivity failures are transient.
    fn put_object(&self, key: &str, file: &Path, content_type: &str) -> Result<String, ArchiveError>;

    /// Whether an object is stored under `key`.
    ///
    /// # Errors
    ///
    /// Connectivity failures are transient.
    fn object_exists(&self, key: &str) -> Result<bool, ArchiveError>;
}
