use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::ObjectStore;
use crate::error::{ArchiveError, ErrorCode};

/// Object store backed by a local directory tree.
///
/// Objects are written to a sibling temp file and renamed into place, so a
/// reader never observes a half-written artifact.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ArchiveError::Store(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

fn upload_error(err: &io::Error) -> ArchiveError {
    ArchiveError::transient(ErrorCode::UploadFailed, "put object", err)
}

impl ObjectStore for FsObjectStore {
    fn put_object(&self, key: &str, file: &Path, _content_type: &str) -> Result<String, ArchiveError> {
        let target = self.object_path(key)?;
        let parent = target
            .parent()
            .ok_or_else(|| ArchiveError::Store(format!("invalid object key '{key}'")))?;
        fs::create_dir_all(parent).map_err(|e| upload_error(&e))?;

        let staging = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(parent)
            .map_err(|e| upload_error(&e))?;
        fs::copy(file, staging.path()).map_err(|e| upload_error(&e))?;
        staging.as_file().sync_all().map_err(|e| upload_error(&e))?;
        staging
            .persist(&target)
            .map_err(|e| upload_error(&e.error))?;

        debug!(key, path = %target.display(), "object stored");
        Ok(format!("file://{}", target.display()))
    }

    fn object_exists(&self, key: &str) -> Result<bool, ArchiveError> {
        let target = self.object_path(key)?;
        target
            .try_exists()
            .map_err(|e| ArchiveError::transient(ErrorCode::UploadFailed, "stat object", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("bucket")).unwrap();
        let source = dir.path().join("artifact.jsonl.gz");
        fs::write(&source, b"payload").unwrap();

        let key = "2/message/day/2017/08/10.jsonl.gz";
        assert!(!store.object_exists(key).unwrap());
        let url = store.put_object(key, &source, "application/json").unwrap();

        assert!(url.starts_with("file://"));
        assert!(url.ends_with(key));
        assert!(store.object_exists(key).unwrap());
        assert_eq!(fs::read(store.root().join(key)).unwrap(), b"payload");
    }

    #[test]
    fn put_overwrites_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("bucket")).unwrap();
        let source = dir.path().join("artifact");
        let key = "2/run/month/2017/08.jsonl.gz";

        fs::write(&source, b"first").unwrap();
        store.put_object(key, &source, "application/json").unwrap();
        fs::write(&source, b"second").unwrap();
        store.put_object(key, &source, "application/json").unwrap();

        assert_eq!(fs::read(store.root().join(key)).unwrap(), b"second");
    }

    #[test]
    fn escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        assert!(store.object_exists("../outside").is_err());
        assert!(store.object_exists("/etc/passwd").is_err());
        assert!(store.object_exists("").is_err());
    }

    #[test]
    fn missing_source_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let err = store
            .put_object("1/message/day/2017/08/10.jsonl.gz", &dir.path().join("nope"), "x")
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), ErrorCode::UploadFailed);
    }
}
