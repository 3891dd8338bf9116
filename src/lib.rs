//! `sightings` is a privacy-preserving sighting-report server.
//!
//! Clients submit opaque contact identifiers and coarse location points,
//! each carrying a one-way update token; later amendments walk a hash chain
//! of replacement tokens, so a submitter can amend or retract earlier
//! reports without the server learning who they are. Reads are bounded
//! scans by identifier prefix or geographic bounding box over a half-open
//! time window, paginated by a result budget.
//!
//! Storage is one JSON file per record under a hash-sharded directory tree,
//! mirrored by in-memory indexes rebuilt from the tree at startup. Servers
//! replicate from each other through the same paginated /sync feed clients
//! use for catch-up.

pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod record;
pub mod replication;
pub mod retention;
pub mod server;
pub mod store;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{ScanError, SightingsEngine};
