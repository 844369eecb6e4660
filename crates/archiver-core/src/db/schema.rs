//! Metadata store schema.
//!
//! One row per archive. Dates are stored as ISO `YYYY-MM-DD` text so the
//! uniqueness constraint and ordering work on the natural key; timestamps are
//! microseconds since the Unix epoch.

/// Initial schema: the archive table and store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS archives (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    archive_type TEXT NOT NULL CHECK (archive_type IN ('message', 'run')),
    period TEXT NOT NULL CHECK (period IN ('day', 'month')),
    start_date TEXT NOT NULL,
    record_count INTEGER NOT NULL DEFAULT 0 CHECK (record_count >= 0),
    size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
    hash TEXT NOT NULL CHECK (length(hash) > 0),
    url TEXT NOT NULL DEFAULT '',
    needs_deletion INTEGER NOT NULL DEFAULT 0 CHECK (needs_deletion IN (0, 1)),
    is_purged INTEGER NOT NULL DEFAULT 0 CHECK (is_purged IN (0, 1)),
    build_time_ms INTEGER NOT NULL DEFAULT 0,
    rollup_id INTEGER REFERENCES archives(id),
    created_at_us INTEGER NOT NULL,
    CHECK (period = 'day' OR substr(start_date, 9, 2) = '01'),
    CHECK (period = 'day' OR rollup_id IS NULL),
    UNIQUE (org_id, archive_type, period, start_date)
);

CREATE TABLE IF NOT EXISTS archiver_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_run_at_us INTEGER
);

INSERT OR IGNORE INTO archiver_meta (id, schema_version, last_run_at_us)
VALUES (1, 0, NULL);
";

/// Query indexes and the rollup/purge guards.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_archives_org_type_start
    ON archives(org_id, archive_type, start_date, period);

CREATE INDEX IF NOT EXISTS idx_archives_rollup
    ON archives(rollup_id)
    WHERE rollup_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_archives_pending_purge
    ON archives(org_id, archive_type)
    WHERE period = 'month' AND needs_deletion = 1 AND is_purged = 0;

CREATE TRIGGER IF NOT EXISTS trg_archives_rollup_immutable
BEFORE UPDATE OF rollup_id ON archives
WHEN OLD.rollup_id IS NOT NULL AND NEW.rollup_id IS NOT OLD.rollup_id
BEGIN
    SELECT RAISE(ABORT, 'rollup link is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_archives_day_purge_requires_rollup
BEFORE UPDATE OF is_purged ON archives
WHEN NEW.is_purged = 1 AND NEW.period = 'day' AND NEW.rollup_id IS NULL
BEGIN
    SELECT RAISE(ABORT, 'day archive must be rolled up before purge');
END;

CREATE TRIGGER IF NOT EXISTS trg_archives_purge_requires_url
BEFORE UPDATE OF is_purged ON archives
WHEN NEW.is_purged = 1 AND NEW.url = ''
BEGIN
    SELECT RAISE(ABORT, 'archive must be uploaded before purge');
END;
";

/// Indexes expected after all migrations.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_archives_org_type_start",
    "idx_archives_rollup",
    "idx_archives_pending_purge",
];

/// Triggers expected after all migrations.
pub const REQUIRED_TRIGGERS: &[&str] = &[
    "trg_archives_rollup_immutable",
    "trg_archives_day_purge_requires_rollup",
    "trg_archives_purge_requires_url",
];
