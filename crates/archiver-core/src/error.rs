use std::fmt;

use crate::model::archive::Archive;

/// Machine-readable error codes for operator and automation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    MisalignedPeriod,
    InvalidStateTransition,
    DuplicatePeriod,
    IncompleteMonth,
    RollupMismatch,
    StoreUnavailable,
    UploadFailed,
    MetadataBusy,
    BuildAborted,
    BuildCancelled,
    PurgeFailed,
    CorruptMetadata,
    ArtifactWriteFailed,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::MisalignedPeriod => "E2001",
            Self::InvalidStateTransition => "E2002",
            Self::DuplicatePeriod => "E2003",
            Self::IncompleteMonth => "E2004",
            Self::RollupMismatch => "E2005",
            Self::StoreUnavailable => "E3001",
            Self::UploadFailed => "E3002",
            Self::MetadataBusy => "E3003",
            Self::BuildAborted => "E4001",
            Self::BuildCancelled => "E4002",
            Self::PurgeFailed => "E4003",
            Self::CorruptMetadata => "E5001",
            Self::ArtifactWriteFailed => "E5002",
            Self::LockContention => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::MisalignedPeriod => "Archive start is not aligned to its period",
            Self::InvalidStateTransition => "Invalid archive state transition",
            Self::DuplicatePeriod => "Archive period already covered",
            Self::IncompleteMonth => "Month is not fully covered by day archives",
            Self::RollupMismatch => "Day archive cannot be linked to this rollup",
            Self::StoreUnavailable => "Record store unavailable",
            Self::UploadFailed => "Object upload failed",
            Self::MetadataBusy => "Metadata store busy",
            Self::BuildAborted => "Artifact build aborted",
            Self::BuildCancelled => "Artifact build cancelled",
            Self::PurgeFailed => "Source record purge failed",
            Self::CorruptMetadata => "Corrupt archive metadata row",
            Self::ArtifactWriteFailed => "Artifact write failed",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the archiver config.toml and retry."),
            Self::MisalignedPeriod | Self::InternalUnexpected => {
                Some("Retry once. If persistent, report a bug with logs.")
            }
            Self::InvalidStateTransition => Some(
                "Follow valid transitions: scheduled -> built -> persisted -> rolled-up -> purged.",
            ),
            Self::DuplicatePeriod => None,
            Self::IncompleteMonth => {
                Some("Run the archiver again so the missing day archives are built first.")
            }
            Self::RollupMismatch => Some("Inspect the day archives with `archiver list`."),
            Self::StoreUnavailable => Some("Check record store connectivity; the run will retry."),
            Self::UploadFailed => Some("Check object storage credentials and connectivity."),
            Self::MetadataBusy => Some("Retry after the other archiver process commits."),
            Self::BuildAborted | Self::ArtifactWriteFailed => {
                Some("Check disk space and write permissions on the temp directory.")
            }
            Self::BuildCancelled => None,
            Self::PurgeFailed => Some("The archive is intact; the purge is retried on the next run."),
            Self::CorruptMetadata => Some("Inspect the archives table for hand-edited rows."),
            Self::LockContention => Some("Retry after the other `archiver` process releases its lock."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by the scheduling, build, rollup, and orchestration layers.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Connectivity failure against a collaborator; safe to retry.
    #[error("{code}: {operation} failed: {message}")]
    Transient {
        code: ErrorCode,
        operation: &'static str,
        message: String,
    },

    /// The requested write would break the archive timeline.
    #[error("{code}: {context}: {reason}")]
    Consistency {
        code: ErrorCode,
        context: String,
        reason: String,
    },

    /// The record stream or artifact write failed mid-build.
    #[error("{}: build of {context} aborted: {source}", ErrorCode::BuildAborted)]
    PartialBuild {
        context: String,
        #[source]
        source: Box<ArchiveError>,
    },

    /// Source deletion failed after the archive was committed.
    #[error("{}: purge of {context} failed: {source}", ErrorCode::PurgeFailed)]
    Purge {
        context: String,
        #[source]
        source: Box<ArchiveError>,
    },

    #[error("{}: operation cancelled", ErrorCode::BuildCancelled)]
    Cancelled,

    /// Non-retryable record store failure (bad row, schema mismatch).
    #[error("record store error: {0}")]
    Store(String),

    #[error("metadata store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn transient(code: ErrorCode, operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Transient {
            code,
            operation,
            message: message.to_string(),
        }
    }

    /// Build a consistency violation carrying the archive's full period context.
    pub fn consistency(code: ErrorCode, archive: &Archive, reason: impl Into<String>) -> Self {
        Self::Consistency {
            code,
            context: archive.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn partial_build(archive: &Archive, source: Self) -> Self {
        Self::PartialBuild {
            context: archive.to_string(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn purge(archive: &Archive, source: Self) -> Self {
        Self::Purge {
            context: archive.to_string(),
            source: Box::new(source),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transient { code, .. } | Self::Consistency { code, .. } => *code,
            Self::PartialBuild { source, .. } => match source.as_ref() {
                Self::Cancelled => ErrorCode::BuildCancelled,
                _ => ErrorCode::BuildAborted,
            },
            Self::Purge { .. } => ErrorCode::PurgeFailed,
            Self::Cancelled => ErrorCode::BuildCancelled,
            Self::Store(_) => ErrorCode::StoreUnavailable,
            Self::Database(err) if is_busy(err) => ErrorCode::MetadataBusy,
            Self::Database(rusqlite::Error::FromSqlConversionFailure(..)) => {
                ErrorCode::CorruptMetadata
            }
            Self::Database(_) => ErrorCode::InternalUnexpected,
            Self::Io(_) => ErrorCode::ArtifactWriteFailed,
            Self::Serialize(_) => ErrorCode::BuildAborted,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Database(err) => is_busy(err),
            Self::PartialBuild { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the error is (or wraps) a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::PartialBuild { source, .. } | Self::Purge { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}
