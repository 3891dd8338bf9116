//! Request bodies the engine consumes and the outcomes it produces.
//!
//! ISO-8601 conversion happens at the HTTP layer; everything here is seconds
//! since the epoch.

use serde::Deserialize;
use serde_json::Value;

use crate::record::Record;
use crate::store::spatial::BoundingBox;

/// POST /status/send — one submission of sightings.
#[derive(Debug, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub contact_ids: Vec<Record>,
    #[serde(default)]
    pub locations: Vec<Record>,
    /// Copied into every data point of the submission.
    pub memo: Option<Value>,
    pub replaces: Option<Value>,
    pub status: Option<Value>,
}

/// POST /status/update — amend earlier records through the token chain.
/// `replaces` carries the chain seed; `update_tokens` are fresh tokens for
/// the replacement records.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub update_tokens: Vec<String>,
    pub replaces: Option<String>,
    pub status: Option<Value>,
    pub length: Option<usize>,
}

/// POST /status/scan — bounded poll by prefix and/or bounding box.
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub since: Option<String>,
    #[serde(default)]
    pub contact_prefixes: Vec<String>,
    #[serde(default)]
    pub locations: Vec<BoundingBox>,
}

/// POST /status/result and /status/data_points — seed-chain operations.
#[derive(Debug, Default, Deserialize)]
pub struct SeedRequest {
    pub seed: Option<String>,
    pub status: Option<Value>,
}

/// Resolved bodies plus pagination state for scan and sync.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub contact_ids: Vec<Value>,
    pub locations: Vec<Value>,
    /// Pass back as the next `since`: seconds of the first item beyond the
    /// result budget, or the window's upper bound when nothing was cut.
    pub until: f64,
    pub more_data: bool,
}
