//! Periodic two-phase expiry.
//!
//! Marking is cheap index surgery under the writer lock; unlinking is disk
//! I/O and runs after the lock is released, so a large expired batch never
//! stalls inserts or queries.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::engine::SightingsEngine;

pub struct RetentionManager {
    engine: Arc<SightingsEngine>,
    clock: Arc<dyn Clock>,
    period: Duration,
    horizon_secs: f64,
}

impl RetentionManager {
    pub fn new(engine: Arc<SightingsEngine>, clock: Arc<dyn Clock>) -> Self {
        let config = engine.config();
        Self {
            clock,
            period: Duration::from_secs(config.retention_sweep_period_secs.max(1)),
            horizon_secs: config.expire_after_secs(),
            engine,
        }
    }

    /// One mark-then-delete pass.
    pub fn sweep_once(&self) -> usize {
        let horizon = self.clock.now() - self.horizon_secs;
        let marked = self.engine.mark_expired(horizon);
        let deleted = self.engine.delete_queued();
        if marked > 0 || deleted > 0 {
            info!(marked, deleted, "retention sweep");
        }
        deleted
    }

    /// Sweep forever on the configured period. Failures are logged inside the
    /// sweep; the task itself never dies.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once();
        }
    }
}
