//! The request-facing core: submissions, token-chain amendments, bounded
//! scans, the replication feed and ingestion from peers.
//!
//! All index mutation happens under one writer lock; the lock is never held
//! across disk reads that resolve matched paths into JSON bodies — those run
//! on the blocking pool against the stores' shared file handles, so a slow
//! disk stalls only the request that hit it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::ledger::UpdateTokenLedger;
use crate::record::{OrderingKey, Record};
use crate::store::prefix::PrefixIndex;
use crate::store::spatial::{BoundingBox, QueryError, SpatialIndex};
use crate::store::{InsertOutcome, RecordFiles, ShardedStore, StoreOptions};
use crate::token::{random_ascii, replacement_token, update_token};

mod messages;

pub use messages::{FeedOutcome, ScanRequest, SeedRequest, SendRequest, UpdateRequest};

/// Fields counted by /init submissions.
const INIT_STATISTICS_FIELDS: [&str; 7] = [
    "application_name",
    "application_version",
    "phone_type",
    "region",
    "health_provider",
    "language",
    "status",
];

#[derive(Debug)]
pub enum ScanError {
    /// The query itself is malformed; rejected cleanly, never fatal.
    BadQuery(QueryError),
    Internal(anyhow::Error),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::BadQuery(err) => write!(f, "{err}"),
            ScanError::Internal(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<QueryError> for ScanError {
    fn from(err: QueryError) -> Self {
        ScanError::BadQuery(err)
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::Internal(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Contact,
    Location,
}

struct EngineState {
    contacts: PrefixIndex,
    locations: SpatialIndex,
    ledger: UpdateTokenLedger,
    statistics: HashMap<&'static str, u64>,
}

impl EngineState {
    fn open(config: &Config) -> anyhow::Result<Self> {
        let options = StoreOptions {
            cache_entries: config.cache_entries,
            retention_secs: config.expire_after_secs(),
            read_retry_attempts: config.read_retry_attempts,
        };
        Ok(Self {
            contacts: PrefixIndex::open(&config.directory, &options)?,
            locations: SpatialIndex::open(
                &config.directory,
                &options,
                config.bounding_box_minimum_dp,
                config.bounding_box_maximum_size,
            )?,
            ledger: UpdateTokenLedger::default(),
            statistics: INIT_STATISTICS_FIELDS.iter().map(|f| (*f, 0)).collect(),
        })
    }
}

pub struct SightingsEngine {
    config: Config,
    clock: Arc<dyn Clock>,
    /// Random per-process token; echoed in sync responses so a peer that is
    /// really ourselves can be recognized.
    server_name: String,
    state: Mutex<EngineState>,
}

impl SightingsEngine {
    pub fn open(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let state = EngineState::open(&config)?;
        Ok(Self {
            config,
            clock,
            server_name: random_ascii(16),
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// `now` for a request: the test-time override is honored only with the
    /// testing flag set.
    pub fn current_time(&self, testing_override: Option<f64>) -> f64 {
        match testing_override {
            Some(seconds) if self.config.testing => seconds,
            _ => self.clock.now(),
        }
    }

    /// Store a submission's data points, two serials apart so a pending
    /// amendment can slot in directly after its target.
    pub fn send_status(&self, req: &SendRequest, now: f64) -> anyhow::Result<()> {
        let mut repeated = Record::new();
        for (field, value) in [
            ("memo", &req.memo),
            ("replaces", &req.replaces),
            ("status", &req.status),
        ] {
            if let Some(value) = value {
                repeated.insert(field.to_string(), value.clone());
            }
        }

        let state = &mut *self.state.lock();
        let mut serial = 0u32;
        for contact in &req.contact_ids {
            let blob = with_repeated(contact, &repeated);
            insert_with_pending(&mut state.contacts, &mut state.ledger, &blob, now, serial)?;
            serial += 2;
        }
        for location in &req.locations {
            let blob = with_repeated(location, &repeated);
            insert_with_pending(&mut state.locations, &mut state.ledger, &blob, now, serial)?;
            serial += 2;
        }
        Ok(())
    }

    /// Amend `length` earlier records through the replacement-token chain
    /// seeded by `replaces`. Tokens whose target has not arrived are held;
    /// too many absent tokens in a row end the batch.
    pub fn status_update(&self, req: &UpdateRequest, now: f64) -> anyhow::Result<()> {
        let (Some(seed), Some(length)) = (req.replaces.as_deref(), req.length) else {
            return Ok(());
        };
        let state = &mut *self.state.lock();
        let mut misses = 0u32;
        for index in 0..length {
            let rt = replacement_token(seed, index);
            let ut = update_token(&rt);
            let mut patch = Record::new();
            patch.insert("replaces".to_string(), json!(rt));
            if let Some(status) = &req.status {
                patch.insert("status".to_string(), status.clone());
            }
            if let Some(next_token) = req.update_tokens.get(index) {
                patch.insert("update_token".to_string(), json!(next_token));
            }
            if apply_update_all(state, &ut, &patch, now, index as u32)? {
                misses = 0;
            } else {
                misses += 1;
                if misses > self.config.max_consecutive_misses {
                    info!(index, "ending update batch after consecutive misses");
                    break;
                }
                state.ledger.hold(&ut, patch);
            }
        }
        Ok(())
    }

    /// Bounded scan over `[since, now)` for the given prefixes and boxes.
    pub async fn scan_status(
        &self,
        req: &ScanRequest,
        since: f64,
        now: f64,
    ) -> Result<FeedOutcome, ScanError> {
        let limit = self.config.max_sync_count;
        let (contact_paths, location_paths, until, more_data, contact_files, location_files) = {
            let state = self.state.lock();
            state.locations.validate_boxes(&req.locations)?;

            // clamp the window before filtering so an abusive query cannot
            // force an unbounded match set
            let bound = state
                .contacts
                .store()
                .max_until(since, now, limit)
                .min(state.locations.store().max_until(since, now, limit));

            let mut matches: Vec<(OrderingKey, Kind, String)> = Vec::new();
            for prefix in &req.contact_prefixes {
                for (okey, path) in
                    state.contacts.matching_paths(prefix, Some(since), Some(bound))
                {
                    matches.push((okey, Kind::Contact, path));
                }
            }
            for bb in &req.locations {
                for (okey, path) in state.locations.matching_paths(bb, Some(since), Some(bound)) {
                    matches.push((okey, Kind::Location, path));
                }
            }
            matches.sort_by(|a, b| a.0.cmp(&b.0));

            let truncated = matches.len() > limit;
            // cut at the first excluded item's second so resumption cannot
            // skip; if more than `limit` records share one second, a client
            // resuming there re-reads that second and makes no progress
            let until = if truncated {
                matches[limit].0.seconds
            } else {
                bound
            };
            matches.truncate(limit);

            let (contacts, locations) = split_paths(matches);
            (
                contacts,
                locations,
                until,
                truncated || bound < now,
                Arc::clone(state.contacts.store().files()),
                Arc::clone(state.locations.store().files()),
            )
        };

        let contact_ids = read_bodies(contact_files, contact_paths, now).await?;
        let locations = read_bodies(location_files, location_paths, now).await?;
        Ok(FeedOutcome {
            contact_ids,
            locations,
            until,
            more_data,
        })
    }

    /// Unfiltered feed of everything in `[since, now)`; the peer-replication
    /// and catch-up path.
    pub async fn sync(&self, since: f64, now: f64) -> anyhow::Result<FeedOutcome> {
        let limit = self.config.max_sync_count;
        let (contact_paths, location_paths, until, more_data, contact_files, location_files) = {
            let state = self.state.lock();
            let mut merged: Vec<(OrderingKey, Kind, String)> = Vec::new();
            for (kind, store) in [
                (Kind::Contact, state.contacts.store()),
                (Kind::Location, state.locations.store()),
            ] {
                for okey in store.range(since, now) {
                    match store.path_for(*okey) {
                        Some(path) => merged.push((*okey, kind, path.to_string())),
                        None => warn!(?okey, store = store.name(), "ordering key without path"),
                    }
                }
            }
            merged.sort_by(|a, b| a.0.cmp(&b.0));

            let truncated = merged.len() > limit;
            // same-second ties past the budget stall resumption, as in scan
            let until = if truncated {
                merged[limit].0.seconds
            } else {
                now
            };
            merged.truncate(limit);

            let (contacts, locations) = split_paths(merged);
            (
                contacts,
                locations,
                until,
                truncated,
                Arc::clone(state.contacts.store().files()),
                Arc::clone(state.locations.store().files()),
            )
        };

        let contact_ids = read_bodies(contact_files, contact_paths, now).await?;
        let locations = read_bodies(location_files, location_paths, now).await?;
        Ok(FeedOutcome {
            contact_ids,
            locations,
            until,
            more_data,
        })
    }

    /// Walk the seed's replacement chain from index zero, patching every
    /// record found; stops after the configured run of absent tokens.
    pub fn status_result(&self, req: &SeedRequest, now: f64) -> anyhow::Result<()> {
        let Some(seed) = req.seed.as_deref() else {
            return Ok(());
        };
        let state = &mut *self.state.lock();
        let mut misses = 0u32;
        let mut index = 0usize;
        loop {
            let rt = replacement_token(seed, index);
            let ut = update_token(&rt);
            let mut patch = Record::new();
            patch.insert("replaces".to_string(), json!(rt));
            if let Some(status) = &req.status {
                patch.insert("status".to_string(), status.clone());
            }
            if apply_update_all(state, &ut, &patch, now, index as u32)? {
                misses = 0;
            } else {
                misses += 1;
                if misses > self.config.max_consecutive_misses {
                    break;
                }
                state.ledger.hold(&ut, patch);
            }
            index += 1;
        }
        Ok(())
    }

    /// Return every record reachable from the seed's token chain.
    pub async fn data_points(&self, seed: &str, now: f64) -> anyhow::Result<FeedOutcome> {
        let (contact_paths, location_paths, contact_files, location_files) = {
            let state = self.state.lock();
            let mut contacts = Vec::new();
            let mut locations = Vec::new();
            let mut misses = 0u32;
            let mut index = 0usize;
            loop {
                let ut = update_token(&replacement_token(seed, index));
                if let Some(path) = state.contacts.store().token_path(&ut) {
                    contacts.push(path.to_string());
                    misses = 0;
                } else if let Some(path) = state.locations.store().token_path(&ut) {
                    locations.push(path.to_string());
                    misses = 0;
                } else {
                    misses += 1;
                    if misses > self.config.max_consecutive_misses {
                        break;
                    }
                }
                index += 1;
            }
            (
                contacts,
                locations,
                Arc::clone(state.contacts.store().files()),
                Arc::clone(state.locations.store().files()),
            )
        };
        let contact_ids = read_bodies(contact_files, contact_paths, now).await?;
        let locations = read_bodies(location_files, location_paths, now).await?;
        Ok(FeedOutcome {
            contact_ids,
            locations,
            until: now,
            more_data: false,
        })
    }

    /// Store records pulled from a peer, tagging each with the peer's
    /// self-token so multi-hop provenance is visible and loops die out.
    /// Records that already passed through this process are skipped.
    pub fn ingest(
        &self,
        contact_records: Vec<Record>,
        location_records: Vec<Record>,
        source_name: &str,
        now: f64,
    ) -> anyhow::Result<usize> {
        let state = &mut *self.state.lock();
        let mut serial = 0u32;
        let mut ingested = 0usize;
        for (kind, records) in [(Kind::Contact, contact_records), (Kind::Location, location_records)]
        {
            for mut record in records {
                if path_contains(&record, &self.server_name) {
                    continue;
                }
                append_path(&mut record, source_name);
                match kind {
                    Kind::Contact => insert_with_pending(
                        &mut state.contacts,
                        &mut state.ledger,
                        &record,
                        now,
                        serial,
                    )?,
                    Kind::Location => insert_with_pending(
                        &mut state.locations,
                        &mut state.ledger,
                        &record,
                        now,
                        serial,
                    )?,
                }
                serial += 2;
                ingested += 1;
            }
        }
        Ok(ingested)
    }

    pub fn record_init(&self, body: &Record) -> Value {
        let state = &mut *self.state.lock();
        for field in INIT_STATISTICS_FIELDS {
            if body.contains_key(field) {
                *state.statistics.entry(field).or_insert(0) += 1;
            }
        }
        json!({
            "bounding_box_minimum_dp": self.config.bounding_box_minimum_dp,
            "bounding_box_maximum_size": self.config.bounding_box_maximum_size,
            "location_resolution": self.config.location_resolution,
            "prefix_bits": 20,
        })
    }

    pub fn admin_status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "contacts_count": state.contacts.store().len(),
            "geo_points": state.locations.store().len(),
            "bounding_box": state.locations.bounds(),
            "pending_updates": state.ledger.len(),
            "statistics": state.statistics.clone(),
        })
    }

    pub fn admin_config(&self) -> Value {
        json!({
            "directory": self.config.directory,
            "testing": self.config.testing,
        })
    }

    /// Drop and reload all state from disk. Test-only; refused unless the
    /// testing flag is set.
    pub fn reset(&self) -> anyhow::Result<bool> {
        if !self.config.testing {
            warn!("reset refused: testing flag not set");
            return Ok(false);
        }
        let fresh = EngineState::open(&self.config)?;
        *self.state.lock() = fresh;
        info!("state reset and reloaded from disk");
        Ok(true)
    }

    /// Retention phase one: drop everything older than the horizon from the
    /// indexes of both stores. In-memory only.
    pub fn mark_expired(&self, until: f64) -> usize {
        let state = &mut *self.state.lock();
        state.contacts.store_mut().mark_expired(until)
            + state.locations.store_mut().mark_expired(until)
    }

    /// Retention phase two: unlink queued files, off the writer lock.
    pub fn delete_queued(&self) -> usize {
        let batches = {
            let state = &mut *self.state.lock();
            [
                (
                    Arc::clone(state.contacts.store().files()),
                    state.contacts.store_mut().take_deletions(),
                ),
                (
                    Arc::clone(state.locations.store().files()),
                    state.locations.store_mut().take_deletions(),
                ),
            ]
        };
        let mut deleted = 0usize;
        for (files, paths) in batches {
            for path in paths {
                match files.remove_record(&path) {
                    Ok(()) => deleted += 1,
                    Err(err) => warn!(%path, %err, "failed to delete expired record"),
                }
            }
        }
        deleted
    }
}

fn with_repeated(record: &Record, repeated: &Record) -> Record {
    let mut blob = record.clone();
    for (field, value) in repeated {
        blob.insert(field.clone(), value.clone());
    }
    blob
}

/// Insert one record; when a pending amendment is waiting on its token, the
/// amended copy follows at the next serial.
fn insert_with_pending<S: ShardedStore>(
    store: &mut S,
    ledger: &mut UpdateTokenLedger,
    record: &Record,
    now: f64,
    serial: u32,
) -> anyhow::Result<()> {
    let outcome = store.insert_record(record, OrderingKey::new(now, serial))?;
    if outcome != InsertOutcome::Inserted {
        return Ok(());
    }
    let token = record.get("update_token").and_then(|v| v.as_str());
    if let Some(patch) = token.and_then(|t| ledger.take(t)) {
        let mut amended = with_repeated(record, &patch);
        // a patch without a fresh token must not keep the target's, or the
        // copy is dropped as a duplicate of the record it amends
        if !patch.contains_key("update_token") {
            amended.remove("update_token");
        }
        store.insert_record(&amended, OrderingKey::new(now, serial + 1))?;
    }
    Ok(())
}

/// Try the amendment against both stores; a token lives in at most one.
fn apply_update_all(
    state: &mut EngineState,
    token: &str,
    patch: &Record,
    now: f64,
    serial: u32,
) -> anyhow::Result<bool> {
    let okey = OrderingKey::new(now, serial);
    if state.contacts.apply_update(token, patch, okey, now)? {
        return Ok(true);
    }
    state.locations.apply_update(token, patch, okey, now)
}

fn split_paths(matches: Vec<(OrderingKey, Kind, String)>) -> (Vec<String>, Vec<String>) {
    let mut contacts = Vec::new();
    let mut locations = Vec::new();
    for (_, kind, path) in matches {
        match kind {
            Kind::Contact => contacts.push(path),
            Kind::Location => locations.push(path),
        }
    }
    (contacts, locations)
}

fn path_contains(record: &Record, name: &str) -> bool {
    record
        .get("path")
        .and_then(|v| v.as_array())
        .map_or(false, |hops| hops.iter().any(|hop| hop.as_str() == Some(name)))
}

fn append_path(record: &mut Record, name: &str) {
    match record.get_mut("path").and_then(|v| v.as_array_mut()) {
        Some(hops) => hops.push(json!(name)),
        None => {
            record.insert("path".to_string(), json!([name]));
        }
    }
}

/// Resolve matched paths into JSON bodies on the blocking pool; a failure
/// here fails only the request that asked.
async fn read_bodies(
    files: Arc<RecordFiles>,
    paths: Vec<String>,
    now: f64,
) -> anyhow::Result<Vec<Value>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .map(|path| files.read_record(path, now).map(Value::Object))
            .collect::<anyhow::Result<Vec<Value>>>()
    })
    .await
    .context("join deferred record reads")?
}
