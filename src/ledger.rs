//! Holding area for updates whose target record has not arrived yet.
//!
//! An amendment can legitimately precede its target when replication lags.
//! The patch is held keyed by its own update token and applied the moment a
//! record carrying that token is inserted.

use std::collections::HashMap;

use crate::record::Record;

#[derive(Debug, Default)]
pub struct UpdateTokenLedger {
    pending: HashMap<String, Record>,
}

impl UpdateTokenLedger {
    /// Hold `patch` until a record with `token` shows up. First writer wins.
    pub fn hold(&mut self, token: &str, patch: Record) {
        self.pending.entry(token.to_string()).or_insert(patch);
    }

    /// Claim a held patch for a just-inserted record's token.
    pub fn take(&mut self, token: &str) -> Option<Record> {
        self.pending.remove(token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
