//! Location store: (lat, long) records bucketed on a fixed grid.
//!
//! Coordinates are truncated to `dp` decimal places and biased positive; the
//! two offsets, fixed-width hex encoded, form the storage key. Distinct points
//! in the same grid cell deliberately share a key. A bounding-box query
//! enumerates the integer cells the box covers and looks each cell's key up
//! directly, reusing the sharded-key machinery instead of a tree-structured
//! spatial index.

use std::path::Path;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::record::{OrderingKey, Record};
use crate::store::{RecordStore, ShardedStore, StoreOptions};

/// A query box. `min`/`max` may arrive reversed; queries normalize them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_long: f64,
    pub max_lat: f64,
    pub max_long: f64,
}

/// Malformed-query rejection; surfaces as a structured error, never a crash.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// A coordinate is not rounded to the configured decimal precision.
    BoxResolution { dp: u32 },
    /// Box area exceeds the configured maximum.
    BoxTooLarge { max_size: f64 },
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::BoxResolution { dp } => {
                write!(f, "bounding box coordinates must be rounded to {dp} decimal places")
            }
            QueryError::BoxTooLarge { max_size } => {
                write!(f, "bounding boxes are limited to {max_size} square degrees")
            }
        }
    }
}

impl std::error::Error for QueryError {}

fn grid_scale(dp: u32) -> f64 {
    10f64.powi(dp as i32)
}

fn hex_width(dp: u32) -> usize {
    // widest offset is the biased longitude: 360 * 10^dp
    let mut value = (360.0 * grid_scale(dp)) as u64;
    let mut width = 1;
    while value >= 16 {
        value /= 16;
        width += 1;
    }
    width
}

/// Key for one integer grid cell (`floor(coordinate * 10^dp)` units).
fn cell_key(lat_cell: i64, long_cell: i64, dp: u32) -> String {
    let scale = grid_scale(dp) as i64;
    let lat_offset = lat_cell + 90 * scale;
    let long_offset = long_cell + 180 * scale;
    let width = hex_width(dp);
    format!("{lat_offset:0width$X}{long_offset:0width$X}")
}

/// Deterministic bucket key for a point; collisions within a cell intended.
pub fn bucket_key(lat: f64, long: f64, dp: u32) -> String {
    let scale = grid_scale(dp);
    cell_key((lat * scale).floor() as i64, (long * scale).floor() as i64, dp)
}

fn coordinate(record: &Record, field: &str) -> Option<f64> {
    record.get(field).and_then(|v| v.as_f64())
}

#[derive(Debug)]
pub struct SpatialIndex {
    store: RecordStore,
    dp: u32,
    max_size: f64,
    /// Observed extent of every inserted point, reported by the admin surface.
    bounds: Option<[f64; 4]>,
}

impl SpatialIndex {
    pub fn open(root: &Path, options: &StoreOptions, dp: u32, max_size: f64) -> anyhow::Result<Self> {
        let mut store = RecordStore::open(root, "spatial_dict", options)?;
        let mut bounds = None;
        store.load_from_disk(|_, record| observe_point(&mut bounds, record))?;
        Ok(Self {
            store,
            dp,
            max_size,
            bounds,
        })
    }

    pub fn bounds(&self) -> Option<[f64; 4]> {
        self.bounds
    }

    /// Reject boxes that are under-resolved or oversized before any cell
    /// enumeration happens; both checks bound worst-case query cost.
    pub fn validate_boxes(&self, boxes: &[BoundingBox]) -> Result<(), QueryError> {
        let scale = grid_scale(self.dp);
        for bb in boxes {
            for value in [bb.min_lat, bb.min_long, bb.max_lat, bb.max_long] {
                let scaled = value * scale;
                if (scaled - scaled.round()).abs() > 1e-6 {
                    return Err(QueryError::BoxResolution { dp: self.dp });
                }
            }
            let lat_span = (bb.max_lat - bb.min_lat).abs();
            let raw_long_span = (bb.max_long - bb.min_long).abs();
            // a box wrapping the anti-meridian covers the short way around
            let long_span = if raw_long_span > 180.0 {
                360.0 - raw_long_span
            } else {
                raw_long_span
            };
            if lat_span * long_span > self.max_size {
                return Err(QueryError::BoxTooLarge { max_size: self.max_size });
            }
        }
        Ok(())
    }

    /// Every record in a cell the (normalized, possibly seam-split) box
    /// covers, within the half-open window.
    pub fn matching_paths(
        &self,
        bb: &BoundingBox,
        since: Option<f64>,
        now: Option<f64>,
    ) -> Vec<(OrderingKey, String)> {
        let (min_lat, max_lat) = ordered(bb.min_lat, bb.max_lat);
        let (min_long, max_long) = ordered(bb.min_long, bb.max_long);

        let long_ranges: Vec<(f64, f64)> = if max_long - min_long > 180.0 {
            // crosses the +-180 seam: cover both sides instead of the
            // whole-world sweep the raw range would imply
            vec![(max_long, 180.0), (-180.0, min_long)]
        } else {
            vec![(min_long, max_long)]
        };

        let scale = grid_scale(self.dp);
        let mut out = Vec::new();
        let lat_cells = (min_lat * scale).floor() as i64..=(max_lat * scale).floor() as i64;
        for lat_cell in lat_cells {
            for (lo, hi) in &long_ranges {
                let long_cells = (lo * scale).floor() as i64..=(hi * scale).floor() as i64;
                for long_cell in long_cells {
                    let key = cell_key(lat_cell, long_cell, self.dp);
                    out.extend(self.store.paths_for_key(&key, since, now));
                }
            }
        }
        out
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn observe_point(bounds: &mut Option<[f64; 4]>, record: &Record) {
    let (Some(lat), Some(long)) = (coordinate(record, "lat"), coordinate(record, "long")) else {
        return;
    };
    match bounds {
        Some([min_lat, min_long, max_lat, max_long]) => {
            *min_lat = min_lat.min(lat);
            *min_long = min_long.min(long);
            *max_lat = max_lat.max(lat);
            *max_long = max_long.max(long);
        }
        None => *bounds = Some([lat, long, lat, long]),
    }
}

impl ShardedStore for SpatialIndex {
    fn store(&self) -> &RecordStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    fn derive_key(&self, record: &Record) -> anyhow::Result<String> {
        let (Some(lat), Some(long)) = (coordinate(record, "lat"), coordinate(record, "long"))
        else {
            bail!("location record needs numeric lat and long fields");
        };
        Ok(bucket_key(lat, long, self.dp))
    }

    fn on_inserted(&mut self, _key: &str, record: &Record) {
        observe_point(&mut self.bounds, record);
    }
}
