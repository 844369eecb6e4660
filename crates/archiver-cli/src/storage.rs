//! Object store backends selectable from config.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use archiver_core::config::{ArchiverConfig, StorageBackend};
use archiver_core::error::{ArchiveError, ErrorCode};
use archiver_core::store::ObjectStore;
use archiver_core::store::fs::FsObjectStore;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Objects stored with `PUT`/`HEAD` under a base URL (S3-compatible
/// gateways, presigned buckets, plain WebDAV).
pub struct HttpObjectStore {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("archiver/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }
}

/// Server errors, throttling, and transport failures are retried; other
/// statuses mean the request itself is wrong.
fn http_error(operation: &'static str, err: ureq::Error) -> ArchiveError {
    match err {
        ureq::Error::Status(status, _) if status >= 500 || status == 429 => {
            ArchiveError::transient(ErrorCode::UploadFailed, operation, format!("HTTP {status}"))
        }
        ureq::Error::Status(status, response) => ArchiveError::Store(format!(
            "{operation}: HTTP {status} {}",
            response.status_text()
        )),
        ureq::Error::Transport(transport) => {
            ArchiveError::transient(ErrorCode::UploadFailed, operation, transport)
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put_object(&self, key: &str, file: &Path, content_type: &str) -> Result<String, ArchiveError> {
        const OP: &str = "put object";
        let body = File::open(file)
            .map_err(|e| ArchiveError::transient(ErrorCode::UploadFailed, OP, e))?;
        let length = body
            .metadata()
            .map_err(|e| ArchiveError::transient(ErrorCode::UploadFailed, OP, e))?
            .len();

        let url = self.object_url(key);
        let request = self
            .authorize(self.agent.put(&url))
            .set("Content-Type", content_type)
            .set("Content-Encoding", "gzip")
            .set("Content-Length", &length.to_string());
        request.send(body).map_err(|e| http_error(OP, e))?;

        debug!(key, url = %url, bytes = length, "object uploaded");
        Ok(url)
    }

    fn object_exists(&self, key: &str) -> Result<bool, ArchiveError> {
        let url = self.object_url(key);
        match self.authorize(self.agent.head(&url)).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(err) => Err(http_error("stat object", err)),
        }
    }
}

/// Build the object store named by `config.storage`.
pub fn open_object_store(config: &ArchiverConfig) -> Result<Box<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::Fs => {
            let store = FsObjectStore::new(&config.storage.root).with_context(|| {
                format!("Failed to open storage root {}", config.storage.root.display())
            })?;
            Ok(Box::new(store))
        }
        StorageBackend::Http => {
            let base_url = config
                .storage
                .base_url
                .as_deref()
                .context("storage.base_url is required for the http backend")?;
            let token = std::env::var("ARCHIVER_STORAGE_TOKEN").ok();
            Ok(Box::new(HttpObjectStore::new(base_url, token)))
        }
    }
}
