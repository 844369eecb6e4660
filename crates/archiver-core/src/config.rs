use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::ArchiveType;
use crate::model::tenant::DEFAULT_ACTIVE_DAYS;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding archive metadata.
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    /// SQLite file holding the live tenant records.
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            metadata_path: default_metadata_path(),
            records_path: default_records_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    Http,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "file" | "local" => Ok(Self::Fs),
            "http" | "https" | "s3" => Ok(Self::Http),
            other => Err(format!("unknown storage backend '{other}': expected fs or http")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Bucket base URL for the `http` backend, e.g. `https://s3.example.com/archives`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: default_storage_root(),
            base_url: None,
            content_type: default_content_type(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Most recent days left unarchived for tenants without their own setting.
    #[serde(default = "default_active_days")]
    pub active_days: u32,
    #[serde(default = "default_true")]
    pub messages: bool,
    #[serde(default = "default_true")]
    pub runs: bool,
    /// Permit source deletion for tenants that do not retain records.
    #[serde(default)]
    pub delete: bool,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            active_days: default_active_days(),
            messages: default_true(),
            runs: default_true(),
            delete: false,
            compression_level: default_compression_level(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl ArchiverConfig {
    /// Record types enabled for this run, in processing order.
    #[must_use]
    pub fn enabled_types(&self) -> Vec<ArchiveType> {
        ArchiveType::ALL
            .into_iter()
            .filter(|t| match t {
                ArchiveType::Message => self.archive.messages,
                ArchiveType::Run => self.archive.runs,
            })
            .collect()
    }

    /// Advisory lock file guarding one metadata store.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .database
            .metadata_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_else(|| "archiver".into());
        name.push(".lock");
        self.database.metadata_path.with_file_name(name)
    }
}

/// Default config location: `<config dir>/archiver/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("archiver/config.toml"))
}

/// Load config from `path`, falling back to defaults when the file is absent.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<ArchiverConfig> {
    if !path.exists() {
        return Ok(ArchiverConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ArchiverConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Apply `ARCHIVER_*` overrides read through `lookup`.
///
/// # Errors
///
/// Returns an error when a numeric or enum override does not parse.
pub fn apply_env_overrides(
    config: &mut ArchiverConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(path) = lookup("ARCHIVER_METADATA_PATH") {
        config.database.metadata_path = PathBuf::from(path);
    }
    if let Some(path) = lookup("ARCHIVER_RECORDS_PATH") {
        config.database.records_path = PathBuf::from(path);
    }
    if let Some(raw) = lookup("ARCHIVER_STORAGE_BACKEND") {
        config.storage.backend = raw
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid ARCHIVER_STORAGE_BACKEND")?;
    }
    if let Some(root) = lookup("ARCHIVER_STORAGE_ROOT") {
        config.storage.root = PathBuf::from(root);
    }
    if let Some(url) = lookup("ARCHIVER_STORAGE_URL") {
        config.storage.base_url = Some(url);
    }
    if let Some(dir) = lookup("ARCHIVER_TEMP_DIR") {
        config.archive.temp_dir = PathBuf::from(dir);
    }
    if let Some(raw) = lookup("ARCHIVER_ACTIVE_DAYS") {
        config.archive.active_days = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid ARCHIVER_ACTIVE_DAYS '{raw}'"))?;
    }
    if let Some(raw) = lookup("ARCHIVER_WORKERS") {
        config.archive.workers = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid ARCHIVER_WORKERS '{raw}'"))?;
    }
    if let Some(raw) = lookup("ARCHIVER_DELETE") {
        config.archive.delete = parse_flag(&raw)
            .with_context(|| format!("Invalid ARCHIVER_DELETE '{raw}'"))?;
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}

const fn default_true() -> bool {
    true
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("archiver.db")
}

fn default_records_path() -> PathBuf {
    PathBuf::from("records.db")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("archive-store")
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("archiver")
}

const fn default_active_days() -> u32 {
    DEFAULT_ACTIVE_DAYS
}

const fn default_compression_level() -> u32 {
    6
}

const fn default_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_backoff_ms() -> u64 {
    500
}
