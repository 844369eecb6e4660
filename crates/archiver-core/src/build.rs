//! Streamed artifact construction.
//!
//! Records flow from the [`RecordStore`] straight through a gzip encoder into
//! a named temp file, one JSON object per line, so memory stays bounded by
//! the encoder buffers regardless of period size. The content hash covers the
//! uncompressed JSONL bytes.
//!
//! The temp file is owned by a [`NamedTempFile`] until the build completes,
//! so any early return (store failure, serialization error, cancellation)
//! removes the partial file on drop.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::ArchiveError;
use crate::model::{Archive, Tenant};
use crate::store::RecordStore;

/// Writer adapter that hashes every byte passed through it.
struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, self.hasher.finalize().to_hex().to_string())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Artifact {
    path: PathBuf,
    record_count: u64,
    size: u64,
    hash: String,
}

/// Builds compressed JSONL artifacts under one temp directory.
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    temp_dir: PathBuf,
    compression: Compression,
}

impl ArtifactBuilder {
    /// Create a builder writing into `temp_dir` at gzip `level` (0-9).
    ///
    /// # Errors
    ///
    /// Returns an error if `temp_dir` cannot be created.
    pub fn new(temp_dir: impl Into<PathBuf>, level: u32) -> io::Result<Self> {
        let temp_dir = temp_dir.into();
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            temp_dir,
            compression: Compression::new(level.min(9)),
        })
    }

    /// Stream every record for `archive`'s period into a new local artifact
    /// and move the archive to `Built`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::PartialBuild`] wrapping the store, I/O, or
    /// cancellation error; no file is left behind in that case.
    pub fn build(
        &self,
        archive: &mut Archive,
        tenant: &Tenant,
        records: &dyn RecordStore,
        cancel: &CancelToken,
    ) -> Result<(), ArchiveError> {
        let started = Instant::now();
        let artifact = self
            .write_artifact(archive, tenant, records, cancel)
            .map_err(|err| ArchiveError::partial_build(archive, err))?;
        let build_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            archive = %archive,
            record_count = artifact.record_count,
            size = artifact.size,
            hash = %artifact.hash,
            build_time_ms,
            "artifact built"
        );

        if let Err(err) = archive.mark_built(
            artifact.record_count,
            artifact.size,
            artifact.hash,
            artifact.path.clone(),
            build_time_ms,
        ) {
            if let Err(cleanup) = fs::remove_file(&artifact.path) {
                warn!(
                    path = %artifact.path.display(),
                    error = %cleanup,
                    "failed to remove rejected artifact"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    fn write_artifact(
        &self,
        archive: &Archive,
        tenant: &Tenant,
        records: &dyn RecordStore,
        cancel: &CancelToken,
    ) -> Result<Artifact, ArchiveError> {
        cancel.check()?;

        let temp = tempfile::Builder::new()
            .prefix(&archive.temp_prefix())
            .suffix(".jsonl.gz")
            .tempfile_in(&self.temp_dir)?;
        debug!(path = %temp.path().display(), archive = %archive, "writing artifact");

        let encoder = GzEncoder::new(BufWriter::new(temp), self.compression);
        let mut writer = HashingWriter::new(encoder);
        let archive_type = archive.archive_type;
        let anonymize = tenant.anonymize;
        let mut lines = 0_u64;

        records.stream_records(
            tenant,
            archive_type,
            &archive.time_range(),
            cancel,
            &mut |mut record| {
                if record.archive_type() != archive_type {
                    return Err(ArchiveError::Store(format!(
                        "record store returned a {} record for a {archive_type} archive",
                        record.archive_type()
                    )));
                }
                if anonymize {
                    record.anonymize();
                }
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                lines += 1;
                Ok(())
            },
        )?;
        cancel.check()?;

        let (encoder, hash) = writer.finish();
        let buffered = encoder.finish()?;
        let temp: NamedTempFile = buffered.into_inner().map_err(io::IntoInnerError::into_error)?;
        temp.as_file().sync_all()?;
        let size = temp.as_file().metadata()?.len();
        let (_file, path) = temp.keep().map_err(|e| e.error)?;

        Ok(Artifact {
            path,
            record_count: lines,
            size,
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::{ContactRef, Direction, FlowRef, MessageRecord, PathStep, RunRecord, RunValue};
    use std::collections::BTreeMap;
    use crate::model::{ArchiveState, ArchiveType, Period, Record, TimeRange};
    use chrono::{NaiveDate, TimeZone, Utc};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::path::Path;

    struct VecStore {
        records: Vec<Record>,
        fail_after: Option<usize>,
    }

    impl RecordStore for VecStore {
        fn stream_records(
            &self,
            _tenant: &Tenant,
            _archive_type: ArchiveType,
            _range: &TimeRange,
            cancel: &CancelToken,
            sink: &mut crate::store::RecordSink<'_>,
        ) -> Result<u64, ArchiveError> {
            let mut count = 0;
            for (i, record) in self.records.iter().enumerate() {
                cancel.check()?;
                if self.fail_after == Some(i) {
                    return Err(ArchiveError::transient(
                        crate::error::ErrorCode::StoreUnavailable,
                        "stream records",
                        "connection reset",
                    ));
                }
                sink(record.clone())?;
                count += 1;
            }
            Ok(count)
        }

        fn delete_records(
            &self,
            _tenant: &Tenant,
            _archive_type: ArchiveType,
            _range: &TimeRange,
        ) -> Result<u64, ArchiveError> {
            Ok(0)
        }
    }

    fn tenant(anonymize: bool) -> Tenant {
        Tenant {
            id: 1,
            name: "Org 1".into(),
            earliest_eligible: Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap(),
            anonymize,
            retain_after_archive: true,
            active_days: 90,
        }
    }

    fn message(id: i64) -> Record {
        let at = Utc.with_ymd_and_hms(2017, 8, 12, 10, 0, 0).unwrap();
        Record::Message(MessageRecord {
            id,
            uuid: format!("uuid-{id}"),
            contact: ContactRef {
                uuid: "contact-1".into(),
                name: Some("Ajodinabiff Dane".into()),
            },
            urn: Some("tel:+12067799192".into()),
            channel: None,
            direction: Direction::In,
            msg_type: "inbox".into(),
            status: "handled".into(),
            visibility: "visible".into(),
            text: format!("message {id}"),
            attachments: Vec::new(),
            labels: Vec::new(),
            created_on: at,
            sent_on: None,
            modified_on: at,
        })
    }

    fn task(tenant: &Tenant) -> Archive {
        Archive::scheduled(
            tenant,
            ArchiveType::Message,
            Period::Day,
            NaiveDate::from_ymd_opt(2017, 8, 12).unwrap(),
        )
    }

    fn decompress(path: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(fs::File::open(path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn store(ids: &[i64]) -> VecStore {
        VecStore {
            records: ids.iter().copied().map(message).collect(),
            fail_after: None,
        }
    }

    #[test]
    fn artifact_round_trips_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let mut archive = task(&org);

        builder
            .build(&mut archive, &org, &store(&[3, 1, 2]), &CancelToken::new())
            .unwrap();

        assert_eq!(archive.state(), ArchiveState::Built);
        assert_eq!(archive.record_count, 3);
        let path = archive.local_path.clone().unwrap();
        assert_eq!(archive.size, fs::metadata(&path).unwrap().len());

        let raw = decompress(&path);
        assert_eq!(archive.hash, blake3::hash(&raw).to_hex().to_string());
        let ids: Vec<i64> = String::from_utf8(raw)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn anonymized_tenant_loses_contact_identity() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(true);
        let mut archive = task(&org);
        builder
            .build(&mut archive, &org, &store(&[1]), &CancelToken::new())
            .unwrap();

        let raw = decompress(archive.local_path.as_ref().unwrap());
        let line: serde_json::Value = serde_json::from_slice(raw.trim_ascii_end()).unwrap();
        assert!(line["contact"]["name"].is_null());
        assert!(line["urn"].is_null());
        assert_eq!(line["contact"]["uuid"], "contact-1");
    }

    fn run(id: i64) -> Record {
        let at = Utc.with_ymd_and_hms(2017, 8, 12, 10, 0, 0).unwrap();
        Record::Run(RunRecord {
            id,
            uuid: format!("run-{id}"),
            flow: FlowRef {
                uuid: "flow-1".into(),
                name: "Color Flow".into(),
            },
            contact: ContactRef {
                uuid: "contact-1".into(),
                name: Some("Ajodinabiff Dane".into()),
            },
            responded: true,
            path: vec![PathStep {
                node: "node-1".into(),
                time: at,
            }],
            values: BTreeMap::from([(
                "color".to_string(),
                RunValue {
                    name: "Color".into(),
                    value: "red".into(),
                    category: Some("Red".into()),
                    node: "node-1".into(),
                    time: at,
                },
            )]),
            events: Vec::new(),
            created_on: at,
            modified_on: at,
            exited_on: Some(at),
            exit_type: Some("completed".into()),
            submitted_by: Some("admin@example.com".into()),
        })
    }

    #[test]
    fn anonymized_tenant_run_artifact_hides_submitter() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(true);
        let mut archive = Archive::scheduled(
            &org,
            ArchiveType::Run,
            Period::Day,
            NaiveDate::from_ymd_opt(2017, 8, 12).unwrap(),
        );
        let runs = VecStore {
            records: vec![run(7)],
            fail_after: None,
        };
        builder
            .build(&mut archive, &org, &runs, &CancelToken::new())
            .unwrap();

        let raw = decompress(archive.local_path.as_ref().unwrap());
        let line: serde_json::Value = serde_json::from_slice(raw.trim_ascii_end()).unwrap();
        assert!(line["contact"]["name"].is_null());
        assert!(line["submitted_by"].is_null());
        assert_eq!(line["uuid"], "run-7");
        assert_eq!(line["contact"]["uuid"], "contact-1");
        assert_eq!(line["path"][0]["node"], "node-1");
        assert_eq!(line["values"]["color"]["value"], "red");
        assert_eq!(line["exit_type"], "completed");
    }

    #[test]
    fn empty_period_produces_empty_gzip_stream() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let mut archive = task(&org);
        builder
            .build(&mut archive, &org, &store(&[]), &CancelToken::new())
            .unwrap();

        let empty_gzip = GzEncoder::new(Vec::new(), Compression::new(6)).finish().unwrap();
        assert_eq!(archive.record_count, 0);
        assert_eq!(archive.size, empty_gzip.len() as u64);
        assert!(archive.size > 0);
        assert!(decompress(archive.local_path.as_ref().unwrap()).is_empty());
        assert_eq!(archive.hash, blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn rebuilding_is_deterministic_and_uses_unique_paths() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let source = store(&[1, 2, 3, 4]);

        let mut first = task(&org);
        let mut second = task(&org);
        builder.build(&mut first, &org, &source, &CancelToken::new()).unwrap();
        builder.build(&mut second, &org, &source, &CancelToken::new()).unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(first.record_count, second.record_count);
        assert_ne!(first.local_path, second.local_path);
        let name = first
            .local_path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap()
            .to_string();
        assert!(name.starts_with("1_message_day_20170812_"));
        assert!(name.ends_with(".jsonl.gz"));
    }

    #[test]
    fn rejected_rebuild_removes_its_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let mut archive = task(&org);
        builder
            .build(&mut archive, &org, &store(&[1]), &CancelToken::new())
            .unwrap();
        let first = archive.local_path.clone().unwrap();

        let err = builder
            .build(&mut archive, &org, &store(&[1, 2]), &CancelToken::new())
            .unwrap_err();

        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
        assert_eq!(archive.local_path.as_ref(), Some(&first));
        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files, vec![first]);
    }

    #[test]
    fn store_failure_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let mut archive = task(&org);
        let failing = VecStore {
            records: (1..=5).map(message).collect(),
            fail_after: Some(3),
        };

        let err = builder
            .build(&mut archive, &org, &failing, &CancelToken::new())
            .unwrap_err();

        assert!(matches!(err, ArchiveError::PartialBuild { .. }));
        assert!(err.is_transient());
        assert_eq!(archive.state(), ArchiveState::Scheduled);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancellation_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ArtifactBuilder::new(dir.path(), 6).unwrap();
        let org = tenant(false);
        let mut archive = task(&org);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = builder
            .build(&mut archive, &org, &store(&[1, 2]), &cancel)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(archive.local_path.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
