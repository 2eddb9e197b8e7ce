//! Replay protection list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TransportError;

/// Last accepted `(iv_index, seq)` per source address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayList {
    entries: HashMap<u16, (u32, u32)>,
}

impl ReplayList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a PDU without recording it
    pub fn check(&self, src: u16, iv_index: u32, seq: u32) -> Result<(), TransportError> {
        match self.entries.get(&src) {
            Some(&(last_iv, last_seq)) if (iv_index, seq) <= (last_iv, last_seq) => {
                Err(TransportError::ReplayDetected { src, seq })
            }
            _ => Ok(()),
        }
    }

    /// Record an accepted PDU
    pub fn commit(&mut self, src: u16, iv_index: u32, seq: u32) {
        let entry = self.entries.entry(src).or_insert((iv_index, seq));
        if (iv_index, seq) > *entry {
            *entry = (iv_index, seq);
        }
    }

    /// Last accepted values for a source
    pub fn last(&self, src: u16) -> Option<(u32, u32)> {
        self.entries.get(&src).copied()
    }

    /// Forget a source (node removed)
    pub fn remove(&mut self, src: u16) {
        self.entries.remove(&src);
    }

    /// Number of tracked sources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no source is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
