//! The sharded, time-ordered record store.
//!
//! One `RecordStore` owns a directory tree `<root>/<AA>/<BB>/<CC>/` (the first
//! six characters of each storage key, two per level) plus the in-memory
//! indexes over it. All indexes are mutated together under the engine's single
//! writer lock: the shard tree, the global time-ordered list, the ordering-key
//! to path map and the update-token index never disagree.
//!
//! `ShardedStore` is the seam between the shared engine and the two key
//! schemes (identifier prefix, spatial bucket); shared logic lives here, not
//! in the implementors.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info};

use crate::record::{data_file_name, in_window, parse_data_file_name, OrderingKey, Record};

mod files;
pub mod prefix;
pub mod spatial;

pub use files::RecordFiles;

/// Tuning knobs shared by both stores.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub cache_entries: usize,
    pub retention_secs: f64,
    pub read_retry_attempts: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_entries: 4096,
            retention_secs: 45.0 * 24.0 * 60.0 * 60.0,
            read_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The record's update token was already present; the submission is a
    /// duplicate and was ignored.
    DuplicateToken,
}

/// Three fixed levels of 2-character shard segments, then key -> ordering
/// keys. Branches are created lazily on insert, never as a side effect of a
/// read.
#[derive(Debug, Default)]
struct ShardTree {
    root: HashMap<String, HashMap<String, HashMap<String, BTreeMap<String, Vec<OrderingKey>>>>>,
}

fn chunk_candidates(tail: &str) -> Vec<String> {
    match tail.len() {
        // nothing pinned at this level: every child is a candidate
        0 => (0..256u16).map(|i| format!("{i:02X}")).collect(),
        // one nibble pinned
        1 => (0..16u8).map(|i| format!("{tail}{i:X}")).collect(),
        _ => vec![tail[..2].to_string()],
    }
}

impl ShardTree {
    fn entries_mut(&mut self, chunks: &[String; 3], key: &str) -> &mut Vec<OrderingKey> {
        self.root
            .entry(chunks[0].clone())
            .or_default()
            .entry(chunks[1].clone())
            .or_default()
            .entry(chunks[2].clone())
            .or_default()
            .entry(key.to_string())
            .or_default()
    }

    fn leaf(&self, chunks: &[String; 3]) -> Option<&BTreeMap<String, Vec<OrderingKey>>> {
        self.root
            .get(&chunks[0])?
            .get(&chunks[1])?
            .get(&chunks[2])
    }

    fn remove(&mut self, chunks: &[String; 3], key: &str, okey: OrderingKey) {
        if let Some(leaf) = self
            .root
            .get_mut(&chunks[0])
            .and_then(|l1| l1.get_mut(&chunks[1]))
            .and_then(|l2| l2.get_mut(&chunks[2]))
        {
            if let Some(entries) = leaf.get_mut(key) {
                entries.retain(|entry| *entry != okey);
                if entries.is_empty() {
                    leaf.remove(key);
                }
            }
        }
    }

    /// Descend two characters of `prefix` per level, expanding to all 256 (or
    /// 16, with one nibble pinned) children where the remaining tail is
    /// shorter than a full segment. Leaf keys are then matched literally.
    fn matching(&self, prefix: &str) -> Vec<(&String, &Vec<OrderingKey>)> {
        let tail = |start: usize| prefix.get(start..).unwrap_or("");
        let mut out = Vec::new();
        for c0 in chunk_candidates(tail(0)) {
            let Some(l1) = self.root.get(&c0) else { continue };
            for c1 in chunk_candidates(tail(2)) {
                let Some(l2) = l1.get(&c1) else { continue };
                for c2 in chunk_candidates(tail(4)) {
                    let Some(leaf) = l2.get(&c2) else { continue };
                    for (key, entries) in leaf {
                        if key.starts_with(prefix) {
                            out.push((key, entries));
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct RecordStore {
    name: String,
    files: Arc<RecordFiles>,
    shards: ShardTree,
    /// Every ordering key, globally sorted; range queries binary-search it.
    by_time: Vec<OrderingKey>,
    path_by_okey: HashMap<OrderingKey, String>,
    /// update_token -> relative path; at most one entry per token, first
    /// writer wins.
    token_index: HashMap<String, String>,
    /// Paths logically removed by [`mark_expired`] awaiting physical unlink.
    pending_delete: Vec<String>,
}

fn shard_chunks(key: &str) -> [String; 3] {
    [
        key[0..2].to_string(),
        key[2..4].to_string(),
        key[4..6].to_string(),
    ]
}

fn update_token_of(record: &Record) -> Option<&str> {
    record.get("update_token").and_then(|v| v.as_str())
}

impl RecordStore {
    pub fn open(root: &Path, name: &str, options: &StoreOptions) -> anyhow::Result<Self> {
        let files = Arc::new(RecordFiles::new(
            root.join(name),
            options.cache_entries,
            options.retention_secs,
            options.read_retry_attempts,
        )?);
        Ok(Self {
            name: name.to_string(),
            files,
            shards: ShardTree::default(),
            by_time: Vec::new(),
            path_by_okey: HashMap::new(),
            token_index: HashMap::new(),
            pending_delete: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &Arc<RecordFiles> {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    /// Rebuild every in-memory index from the `.data` files on disk, invoking
    /// `on_loaded` per record for secondary-index bookkeeping. A file whose
    /// JSON cannot be parsed is skipped and logged, never fatal.
    pub fn load_from_disk(
        &mut self,
        mut on_loaded: impl FnMut(&str, &Record),
    ) -> anyhow::Result<()> {
        let root = self.files.root().to_path_buf();
        for (c0, l1_path) in subdirectories(&root)? {
            for (c1, l2_path) in subdirectories(&l1_path)? {
                for (c2, leaf_path) in subdirectories(&l2_path)? {
                    let entries = std::fs::read_dir(&leaf_path)
                        .with_context(|| format!("read dir {}", leaf_path.display()))?;
                    for entry in entries {
                        let entry = entry?;
                        let file_name = entry.file_name();
                        let Some(file_name) = file_name.to_str() else { continue };
                        let Some((key, okey)) = parse_data_file_name(file_name) else {
                            continue;
                        };
                        let rel_path = format!("{c0}/{c1}/{c2}/{file_name}");
                        let record: Record = match std::fs::read(entry.path())
                            .map_err(anyhow::Error::from)
                            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
                        {
                            Ok(record) => record,
                            Err(err) => {
                                error!(store = %self.name, path = %rel_path, %err,
                                       "skipping unreadable record");
                                continue;
                            }
                        };
                        self.index_record(&key, okey, rel_path, update_token_of(&record));
                        on_loaded(&key, &record);
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert a record under `key`. A duplicate update token makes the whole
    /// insert an idempotent no-op.
    pub fn insert(
        &mut self,
        key: &str,
        record: &Record,
        okey: OrderingKey,
    ) -> anyhow::Result<InsertOutcome> {
        if let Some(token) = update_token_of(record) {
            if self.token_index.contains_key(token) {
                info!(store = %self.name, token, "ignoring duplicate update token");
                return Ok(InsertOutcome::DuplicateToken);
            }
        }
        if !key.is_ascii() {
            bail!("key {key:?} must be ASCII");
        }
        if key.len() < 6 {
            bail!("key {key:?} must be at least 6 characters long");
        }
        let key = key.to_uppercase();
        let chunks = shard_chunks(&key);
        let rel_path = format!(
            "{}/{}/{}/{}",
            chunks[0],
            chunks[1],
            chunks[2],
            data_file_name(&key, okey)
        );
        self.files.write_record(&rel_path, record)?;
        self.index_record(&key, okey, rel_path, update_token_of(record));
        Ok(InsertOutcome::Inserted)
    }

    fn index_record(&mut self, key: &str, okey: OrderingKey, rel_path: String, token: Option<&str>) {
        let chunks = shard_chunks(key);
        self.shards.entries_mut(&chunks, key).push(okey);
        let at = self.by_time.partition_point(|existing| *existing < okey);
        self.by_time.insert(at, okey);
        if let Some(token) = token {
            self.token_index
                .entry(token.to_string())
                .or_insert_with(|| rel_path.clone());
        }
        self.path_by_okey.insert(okey, rel_path);
    }

    pub fn token_path(&self, token: &str) -> Option<&str> {
        self.token_index.get(token).map(String::as_str)
    }

    pub fn path_for(&self, okey: OrderingKey) -> Option<&str> {
        self.path_by_okey.get(&okey).map(String::as_str)
    }

    /// All ordering keys in the half-open window `[since, until)`.
    pub fn range(&self, since: f64, until: f64) -> &[OrderingKey] {
        let lower = self
            .by_time
            .partition_point(|okey| *okey < OrderingKey::new(since, 0));
        let upper = self
            .by_time
            .partition_point(|okey| *okey < OrderingKey::new(until, 0));
        &self.by_time[lower..upper]
    }

    /// Seconds of the `limit`-th item at or after `since`, or `until` if the
    /// window holds fewer. Callers clamp their window to this before running
    /// a filter, bounding the worst-case result set.
    pub fn max_until(&self, since: f64, until: f64, limit: usize) -> f64 {
        let window = self.range(since, until);
        if window.len() > limit {
            window[limit].seconds
        } else {
            until
        }
    }

    /// Matches for a (already uppercased) key prefix, window-filtered.
    pub fn paths_matching_prefix(
        &self,
        prefix: &str,
        since: Option<f64>,
        now: Option<f64>,
    ) -> Vec<(OrderingKey, String)> {
        let prefix = prefix.to_uppercase();
        if !prefix.is_ascii() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (key, entries) in self.shards.matching(&prefix) {
            for okey in entries {
                if in_window(okey.seconds, since, now) {
                    out.push((*okey, self.rel_path_of(key, *okey)));
                }
            }
        }
        out
    }

    /// Matches for one exact storage key, window-filtered.
    pub fn paths_for_key(
        &self,
        key: &str,
        since: Option<f64>,
        now: Option<f64>,
    ) -> Vec<(OrderingKey, String)> {
        let chunks = shard_chunks(key);
        let mut out = Vec::new();
        if let Some(leaf) = self.shards.leaf(&chunks) {
            if let Some(entries) = leaf.get(key) {
                for okey in entries {
                    if in_window(okey.seconds, since, now) {
                        out.push((*okey, self.rel_path_of(key, *okey)));
                    }
                }
            }
        }
        out
    }

    fn rel_path_of(&self, key: &str, okey: OrderingKey) -> String {
        let chunks = shard_chunks(key);
        format!(
            "{}/{}/{}/{}",
            chunks[0],
            chunks[1],
            chunks[2],
            data_file_name(key, okey)
        )
    }

    /// Phase one of expiry: drop every entry older than `until` from all
    /// indexes and queue its path for deletion. Purely in-memory.
    pub fn mark_expired(&mut self, until: f64) -> usize {
        let cut = self
            .by_time
            .partition_point(|okey| *okey < OrderingKey::new(until, 0));
        let expired: Vec<OrderingKey> = self.by_time.drain(..cut).collect();
        for okey in &expired {
            let Some(rel_path) = self.path_by_okey.remove(okey) else {
                continue;
            };
            if let Some((key, _)) = rel_path
                .rsplit('/')
                .next()
                .and_then(parse_data_file_name)
            {
                self.shards.remove(&shard_chunks(&key), &key, *okey);
            }
            info!(store = %self.name, path = %rel_path, "queued expired record");
            self.pending_delete.push(rel_path);
        }
        expired.len()
    }

    /// Phase two of expiry: hand the queued paths to the caller for unlinking
    /// (off the writer lock) after dropping their token-index and cache
    /// entries here.
    pub fn take_deletions(&mut self) -> Vec<String> {
        let paths = std::mem::take(&mut self.pending_delete);
        if paths.is_empty() {
            return paths;
        }
        let doomed: std::collections::HashSet<&str> =
            paths.iter().map(String::as_str).collect();
        self.token_index.retain(|_, path| !doomed.contains(path.as_str()));
        for path in &paths {
            self.files.forget(path);
        }
        paths
    }
}

fn subdirectories(path: &Path) -> anyhow::Result<Vec<(String, std::path::PathBuf)>> {
    let mut out = Vec::new();
    let entries =
        std::fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                out.push((name.to_string(), entry.path()));
            }
        }
    }
    Ok(out)
}

/// Seam between the shared store engine and a concrete key scheme.
pub trait ShardedStore {
    fn store(&self) -> &RecordStore;
    fn store_mut(&mut self) -> &mut RecordStore;

    /// Derive the storage key for a record, e.g. its `id` field or a spatial
    /// bucket.
    fn derive_key(&self, record: &Record) -> anyhow::Result<String>;

    /// Secondary-index bookkeeping after a successful insert.
    fn on_inserted(&mut self, _key: &str, _record: &Record) {}

    fn insert_record(&mut self, record: &Record, okey: OrderingKey) -> anyhow::Result<InsertOutcome> {
        let key = self.derive_key(record)?;
        let outcome = self.store_mut().insert(&key, record, okey)?;
        if outcome == InsertOutcome::Inserted {
            self.on_inserted(&key.to_uppercase(), record);
        }
        Ok(outcome)
    }

    /// Locate the record carrying `token`, lay `patch` over a copy of it and
    /// insert the result as a new record. `false` when the token is unknown;
    /// the caller decides whether to hold the patch.
    fn apply_update(
        &mut self,
        token: &str,
        patch: &Record,
        okey: OrderingKey,
        now: f64,
    ) -> anyhow::Result<bool> {
        let Some(rel_path) = self.store().token_path(token).map(str::to_string) else {
            return Ok(false);
        };
        let files = Arc::clone(self.store().files());
        let mut blob = files.read_record(&rel_path, now)?;
        // without a fresh token the copy would collide with its target's
        // token and be dropped as a duplicate
        if !patch.contains_key("update_token") {
            blob.remove("update_token");
        }
        for (field, value) in patch {
            blob.insert(field.clone(), value.clone());
        }
        self.insert_record(&blob, okey)?;
        Ok(true)
    }
}
