//! Identifier store: opaque hex ids queried by prefix.

use crate::record::{OrderingKey, Record};
use crate::store::{RecordStore, ShardedStore, StoreOptions};

use anyhow::bail;
use std::path::Path;

#[derive(Debug)]
pub struct PrefixIndex {
    store: RecordStore,
}

impl PrefixIndex {
    pub fn open(root: &Path, options: &StoreOptions) -> anyhow::Result<Self> {
        let mut store = RecordStore::open(root, "contact_dict", options)?;
        store.load_from_disk(|_, _| {})?;
        Ok(Self { store })
    }

    /// All records whose key starts with `prefix` (case-insensitive), within
    /// the half-open window.
    pub fn matching_paths(
        &self,
        prefix: &str,
        since: Option<f64>,
        now: Option<f64>,
    ) -> Vec<(OrderingKey, String)> {
        self.store.paths_matching_prefix(prefix, since, now)
    }
}

impl ShardedStore for PrefixIndex {
    fn store(&self) -> &RecordStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    fn derive_key(&self, record: &Record) -> anyhow::Result<String> {
        match record.get("id").and_then(|v| v.as_str()) {
            Some(id) => Ok(id.to_string()),
            None => bail!("identifier record has no id field"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id_record(id: &str) -> Record {
        match json!({ "id": id }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn index_with(ids: &[&str]) -> (tempfile::TempDir, PrefixIndex) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = PrefixIndex::open(dir.path(), &StoreOptions::default()).expect("open");
        for (serial, id) in ids.iter().enumerate() {
            index
                .insert_record(&id_record(id), OrderingKey::new(100.0, serial as u32))
                .expect("insert");
        }
        (dir, index)
    }

    fn matched_keys(index: &PrefixIndex, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = index
            .matching_paths(prefix, None, None)
            .into_iter()
            .map(|(_, path)| path.rsplit('/').next().expect("file name").to_string())
            .map(|name| name.split(':').next().expect("key").to_string())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    #[test]
    fn exact_key_is_its_own_prefix() {
        let (_dir, index) = index_with(&["DEADBEEF01"]);
        assert_eq!(matched_keys(&index, "DEADBEEF01"), vec!["DEADBEEF01"]);
    }

    #[test]
    fn expansion_covers_every_tail_length() {
        let (_dir, index) = index_with(&["DEADBEEF01", "DEAFBEEF01", "CAFEBABE01"]);
        // 0 remaining characters at level 1: everything matches
        assert_eq!(matched_keys(&index, "").len(), 3);
        // 1 pinned nibble at level 1
        assert_eq!(matched_keys(&index, "D"), vec!["DEADBEEF01", "DEAFBEEF01"]);
        // full segment at level 1, empty tail at level 2
        assert_eq!(matched_keys(&index, "DE"), vec!["DEADBEEF01", "DEAFBEEF01"]);
        // 1 pinned nibble at level 2
        assert_eq!(matched_keys(&index, "DEA"), vec!["DEADBEEF01", "DEAFBEEF01"]);
        // pinned through level 2, nibble at level 3
        assert_eq!(matched_keys(&index, "DEADB"), vec!["DEADBEEF01"]);
        // past the sharded six characters: literal match
        assert_eq!(matched_keys(&index, "DEADBEE"), vec!["DEADBEEF01"]);
        assert_eq!(matched_keys(&index, "DEADBEEF01XX"), Vec::<String>::new());
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let (_dir, index) = index_with(&["deadbeef01"]);
        assert_eq!(matched_keys(&index, "dead"), vec!["DEADBEEF01"]);
        assert_eq!(matched_keys(&index, "DEAD"), vec!["DEADBEEF01"]);
    }

    #[test]
    fn window_filter_applies_per_entry() {
        let (_dir, mut index) = index_with(&[]);
        index
            .insert_record(&id_record("DEADBEEF01"), OrderingKey::new(1000.0, 0))
            .expect("insert");
        assert_eq!(
            index.matching_paths("DE", Some(0.0), Some(2000.0)).len(),
            1
        );
        assert!(index.matching_paths("DE", Some(1500.0), Some(2000.0)).is_empty());
    }

    #[test]
    fn record_without_id_is_rejected() {
        let (_dir, mut index) = index_with(&[]);
        let blob = match json!({"status": 2}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(index.insert_record(&blob, OrderingKey::new(1.0, 0)).is_err());
    }
}
