//! On-disk record files plus the recency cache.
//!
//! `RecordFiles` is shared (`Arc`) between the index-owning store and the
//! deferred read path, so resolving a query's file paths into JSON bodies
//! never holds the writer lock. The cache keeps only records younger than the
//! retention window; anything older is rarely re-read and not worth pinning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use tracing::error;

use crate::record::{parse_data_file_name, Record};

#[derive(Debug, Clone)]
struct CachedRecord {
    seconds: f64,
    record: Record,
}

pub struct RecordFiles {
    root: PathBuf,
    cache: Mutex<LruCache<String, CachedRecord>>,
    retention_secs: f64,
    read_attempts: usize,
}

impl std::fmt::Debug for RecordFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFiles")
            .field("root", &self.root)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl RecordFiles {
    pub fn new(
        root: PathBuf,
        cache_entries: usize,
        retention_secs: f64,
        read_attempts: usize,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create store directory {}", root.display()))?;
        let capacity = cache_entries
            .max(1)
            .try_into()
            .expect("cache_entries must fit NonZeroUsize");
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(capacity)),
            retention_secs,
            read_attempts: read_attempts.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    /// Write a record and populate the recency cache.
    pub fn write_record(&self, rel_path: &str, record: &Record) -> anyhow::Result<()> {
        let path = self.full_path(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create shard directory {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec(record).context("encode record")?;
        std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        self.cache_put(rel_path, record);
        Ok(())
    }

    /// Read a record through the cache.
    ///
    /// Transient I/O errors are retried with a small randomized backoff; a
    /// JSON decode failure is never retried — the file is presumed corrupt and
    /// the error surfaces to this one read.
    pub fn read_record(&self, rel_path: &str, now: f64) -> anyhow::Result<Record> {
        if let Some(cached) = self.cache.lock().get(rel_path) {
            if now - cached.seconds < self.retention_secs {
                return Ok(cached.record.clone());
            }
        }
        let path = self.full_path(rel_path);
        let mut attempt = 0usize;
        let bytes = loop {
            attempt += 1;
            match std::fs::read(&path) {
                Ok(bytes) => break bytes,
                Err(err) if attempt < self.read_attempts => {
                    let jitter = rand::thread_rng().gen_range(5..25) * attempt as u64;
                    tracing::warn!(path = %path.display(), attempt, %err, "retrying read");
                    std::thread::sleep(Duration::from_millis(jitter));
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("read {} after {attempt} attempts", path.display())
                    });
                }
            }
        };
        let record: Record = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                error!(path = %path.display(), %err, "corrupt record on disk");
                bail!("corrupt record at {}: {err}", path.display());
            }
        };
        if let Some((_, okey)) = file_name_parts(rel_path) {
            if now - okey.seconds < self.retention_secs {
                self.cache_put(rel_path, &record);
            }
        }
        Ok(record)
    }

    pub fn remove_record(&self, rel_path: &str) -> anyhow::Result<()> {
        self.cache.lock().pop(rel_path);
        let path = self.full_path(rel_path);
        std::fs::remove_file(&path).with_context(|| format!("unlink {}", path.display()))?;
        Ok(())
    }

    pub fn forget(&self, rel_path: &str) {
        self.cache.lock().pop(rel_path);
    }

    fn cache_put(&self, rel_path: &str, record: &Record) {
        let Some((_, okey)) = file_name_parts(rel_path) else {
            return;
        };
        self.cache.lock().put(
            rel_path.to_string(),
            CachedRecord {
                seconds: okey.seconds,
                record: record.clone(),
            },
        );
    }
}

fn file_name_parts(rel_path: &str) -> Option<(String, crate::record::OrderingKey)> {
    parse_data_file_name(rel_path.rsplit('/').next()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> Record {
        match json!({ "id": id }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn write_then_read_hits_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            RecordFiles::new(dir.path().join("contact_dict"), 16, 3600.0, 3).expect("files");
        let rel = "DE/AD/BE/DEADBEEF01:10.000000:0.data";
        files.write_record(rel, &record("DEADBEEF01")).expect("write");

        // remove the backing file: the cached copy must still answer
        std::fs::remove_file(files.full_path(rel)).expect("remove");
        let got = files.read_record(rel, 11.0).expect("cached read");
        assert_eq!(got["id"], "DEADBEEF01");
    }

    #[test]
    fn stale_cache_entries_fall_through_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            RecordFiles::new(dir.path().join("contact_dict"), 16, 100.0, 1).expect("files");
        let rel = "DE/AD/BE/DEADBEEF01:10.000000:0.data";
        files.write_record(rel, &record("DEADBEEF01")).expect("write");
        std::fs::remove_file(files.full_path(rel)).expect("remove");
        // age 200 > retention 100: the cache may not answer, so the read fails
        assert!(files.read_record(rel, 210.0).is_err());
    }

    #[test]
    fn corrupt_record_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            RecordFiles::new(dir.path().join("contact_dict"), 16, 3600.0, 5).expect("files");
        let rel = "DE/AD/BE/DEADBEEF01:10.000000:0.data";
        let path = files.full_path(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"{ not json").expect("write garbage");
        let err = files.read_record(rel, 11.0).expect_err("must fail");
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn missing_file_propagates_after_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            RecordFiles::new(dir.path().join("contact_dict"), 16, 3600.0, 2).expect("files");
        assert!(files.read_record("DE/AD/BE/missing:1.000000:0.data", 2.0).is_err());
    }
}
