//! IV index state and the IV update procedure.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TransportError;

/// Furthest a beacon may move the IV index in one step
pub const MAX_IV_RECOVERY: u32 = 42;

/// IV index and the update-in-progress flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    /// Current IV index
    pub index: u32,
    /// IV update in progress
    pub update_active: bool,
}

/// What applying a beacon changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvUpdate {
    /// Nothing changed
    Unchanged,
    /// Entered the update-in-progress state at a new index
    Started,
    /// Left the update-in-progress state
    Completed,
    /// Jumped forward to catch up with the network
    Recovered,
}

impl IvIndex {
    /// IV index at `index` with no update running
    pub fn new(index: u32) -> Self {
        Self {
            index,
            update_active: false,
        }
    }

    /// Index used for transmission
    pub fn transmit_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// IVI bit for outgoing PDUs
    pub fn ivi(&self) -> bool {
        self.transmit_index() & 1 == 1
    }

    /// Index to use for a received PDU with the given IVI bit
    pub fn receive_index(&self, ivi: bool) -> Option<u32> {
        if (self.index & 1 == 1) == ivi {
            Some(self.index)
        } else {
            self.index.checked_sub(1)
        }
    }

    /// Start an update: the index advances, transmission keeps the old one
    pub fn begin_update(&mut self) {
        if !self.update_active {
            self.index = self.index.wrapping_add(1);
            self.update_active = true;
            info!("iv update started, index {}", self.index);
        }
    }

    /// Finish an update: transmission switches to the new index
    pub fn complete_update(&mut self) {
        if self.update_active {
            self.update_active = false;
            info!("iv update complete, index {}", self.index);
        }
    }

    /// Apply the IV fields of an authenticated secure network beacon
    pub fn apply_beacon(&mut self, index: u32, update_flag: bool) -> Result<IvUpdate, TransportError> {
        if index < self.index {
            return Ok(IvUpdate::Unchanged);
        }
        if index - self.index > MAX_IV_RECOVERY {
            warn!("beacon iv index {} too far ahead of {}", index, self.index);
            return Err(TransportError::IvIndexOutOfRange {
                current: self.index,
                received: index,
            });
        }

        let outcome = match (index == self.index, update_flag, self.update_active) {
            // Same index announced as updating while in normal operation is ignored
            (true, true, _) | (true, false, false) => IvUpdate::Unchanged,
            (true, false, true) => IvUpdate::Completed,
            (false, true, false) if index == self.index + 1 => IvUpdate::Started,
            _ => IvUpdate::Recovered,
        };

        match outcome {
            IvUpdate::Unchanged => {}
            IvUpdate::Started => self.begin_update(),
            IvUpdate::Completed => self.complete_update(),
            IvUpdate::Recovered => {
                self.index = index;
                self.update_active = update_flag;
                info!("iv index recovered to {} (update={})", index, update_flag);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_index_selection() {
        let iv = IvIndex::new(0x1234_5678);
        assert_eq!(iv.receive_index(false), Some(0x1234_5678));
        assert_eq!(iv.receive_index(true), Some(0x1234_5677));
        assert_eq!(IvIndex::new(0).receive_index(true), None);
    }

    #[test]
    fn test_update_cycle() {
        let mut iv = IvIndex::new(10);
        iv.begin_update();
        assert_eq!(iv.index, 11);
        assert_eq!(iv.transmit_index(), 10);
        assert!(!iv.ivi());
        // Both the old and new index are accepted
        assert_eq!(iv.receive_index(true), Some(11));
        assert_eq!(iv.receive_index(false), Some(10));

        iv.complete_update();
        assert_eq!(iv.transmit_index(), 11);
        assert!(iv.ivi());
    }

    #[test]
    fn test_apply_beacon() {
        let mut iv = IvIndex::new(10);
        assert_eq!(iv.apply_beacon(9, false), Ok(IvUpdate::Unchanged));
        assert_eq!(iv.apply_beacon(10, false), Ok(IvUpdate::Unchanged));

        assert_eq!(iv.apply_beacon(11, true), Ok(IvUpdate::Started));
        assert_eq!(iv, IvIndex { index: 11, update_active: true });
        assert_eq!(iv.apply_beacon(11, true), Ok(IvUpdate::Unchanged));
        assert_eq!(iv.apply_beacon(11, false), Ok(IvUpdate::Completed));
        assert!(!iv.update_active);

        assert_eq!(iv.apply_beacon(20, false), Ok(IvUpdate::Recovered));
        assert_eq!(iv.index, 20);

        assert_eq!(
            iv.apply_beacon(20 + MAX_IV_RECOVERY + 1, false),
            Err(TransportError::IvIndexOutOfRange {
                current: 20,
                received: 63
            })
        );
        assert_eq!(iv.index, 20);
    }
}
