//! Pull replication from configured peer servers.
//!
//! Each peer is polled on a fixed period through its /sync feed, resuming
//! from a per-peer watermark persisted next to the data. Every pulled record
//! is tagged with the peer's self-reported server name before insertion, and
//! records that already carry our own name are dropped, so replication loops
//! between mutually-configured servers die out at one hop.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::engine::SightingsEngine;
use crate::record::Record;

const STATUS_FILE: &str = "sync_status.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of a peer's /sync response.
#[derive(Debug, Deserialize)]
struct SyncPage {
    #[serde(default)]
    contact_ids: Vec<Record>,
    #[serde(default)]
    locations: Vec<Record>,
    until: Option<String>,
    #[serde(default)]
    more_data: bool,
    server_name: Option<String>,
}

pub struct ReplicationClient {
    engine: Arc<SightingsEngine>,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
    period: Duration,
    /// Peers still worth polling; a peer that turns out to be ourselves is
    /// dropped for the life of the process.
    peers: Vec<String>,
    /// peer url -> ISO `until` of the last page successfully ingested.
    watermarks: HashMap<String, String>,
    status_path: PathBuf,
}

impl ReplicationClient {
    pub fn new(engine: Arc<SightingsEngine>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let config = engine.config();
        let status_path = config.directory.join(STATUS_FILE);
        let watermarks = load_watermarks(&status_path)?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build replication http client")?;
        Ok(Self {
            clock,
            client,
            period: Duration::from_secs(config.neighbor_sync_period_secs.max(1)),
            peers: config.servers.clone(),
            watermarks,
            status_path,
            engine,
        })
    }

    /// Poll every remaining peer once. Transport or decode failures leave
    /// that peer's watermark alone so the next tick retries the same window.
    pub async fn sync_once(&mut self) {
        let peers = self.peers.clone();
        for peer in peers {
            match self.pull_peer(&peer).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%peer, "peer reported our own server name, removing");
                    self.peers.retain(|p| p != &peer);
                }
                Err(err) => warn!(%peer, %err, "peer sync failed"),
            }
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sync_once().await;
        }
    }

    /// Drain a peer's feed from the saved watermark. Returns false when the
    /// peer is actually this process.
    async fn pull_peer(&mut self, peer: &str) -> anyhow::Result<bool> {
        loop {
            let url = format!("{}/sync", peer.trim_end_matches('/'));
            let mut request = self.client.get(&url);
            if let Some(since) = self.watermarks.get(peer) {
                request = request.query(&[("since", since.as_str())]);
            }
            let page: SyncPage = request
                .send()
                .await
                .with_context(|| format!("request {url}"))?
                .error_for_status()
                .with_context(|| format!("response status from {url}"))?
                .json()
                .await
                .with_context(|| format!("decode sync page from {url}"))?;

            match page.server_name.as_deref() {
                Some(name) if name == self.engine.server_name() => return Ok(false),
                Some(name) => {
                    let now = self.clock.now();
                    let pulled = page.contact_ids.len() + page.locations.len();
                    let ingested =
                        self.engine
                            .ingest(page.contact_ids, page.locations, name, now)?;
                    if pulled > 0 {
                        info!(%peer, pulled, ingested, "ingested sync page");
                    }
                }
                None => anyhow::bail!("sync page from {url} carries no server_name"),
            }

            let Some(until) = page.until else {
                anyhow::bail!("sync page from {url} carries no until");
            };
            self.watermarks.insert(peer.to_string(), until);
            self.persist_watermarks()?;

            if !page.more_data {
                return Ok(true);
            }
        }
    }

    fn persist_watermarks(&self) -> anyhow::Result<()> {
        let blob = serde_json::to_vec_pretty(&self.watermarks)
            .context("encode sync watermarks")?;
        fs::write(&self.status_path, blob)
            .with_context(|| format!("write {}", self.status_path.display()))
    }
}

fn load_watermarks(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let blob = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&blob).with_context(|| format!("decode {}", path.display()))
}
