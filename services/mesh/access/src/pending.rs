//! Outstanding acknowledged requests.
//!
//! Entries are keyed by `(destination, expected status opcode)`. Every entry
//! leaves the table exactly once: resolved by a reply, expired, superseded
//! or cancelled.

use mesh_wire::Opcode;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// An entry removed from the table without a reply
#[derive(Debug)]
pub struct Expired<T> {
    /// Request destination
    pub dst: u16,
    /// Status opcode that never arrived
    pub opcode: Opcode,
    /// Caller payload
    pub payload: T,
}

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    payload: T,
}

/// Table of pending acknowledged requests
#[derive(Debug)]
pub struct PendingRequests<T> {
    entries: HashMap<(u16, Opcode), Entry<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request, returning the payload it supersedes
    pub fn insert(&mut self, dst: u16, opcode: Opcode, deadline: Instant, payload: T) -> Option<T> {
        let previous = self
            .entries
            .insert((dst, opcode), Entry { deadline, payload });
        if previous.is_some() {
            debug!("request to {:#06x} for {} superseded", dst, opcode);
        }
        previous.map(|e| e.payload)
    }

    /// Remove the entry answered by a status from `src`
    pub fn resolve(&mut self, src: u16, opcode: Opcode) -> Option<T> {
        self.entries.remove(&(src, opcode)).map(|e| e.payload)
    }

    /// Whether a reply is awaited
    pub fn contains(&self, dst: u16, opcode: Opcode) -> bool {
        self.entries.contains_key(&(dst, opcode))
    }

    /// Remove every entry whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<Expired<T>> {
        let due: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        due.into_iter()
            .filter_map(|key| {
                self.entries.remove(&key).map(|e| Expired {
                    dst: key.0,
                    opcode: key.1,
                    payload: e.payload,
                })
            })
            .collect()
    }

    /// Remove everything
    pub fn cancel_all(&mut self) -> Vec<Expired<T>> {
        self.entries
            .drain()
            .map(|((dst, opcode), e)| Expired {
                dst,
                opcode,
                payload: e.payload,
            })
            .collect()
    }

    /// Remove every request addressed to `dst`
    pub fn cancel_destination(&mut self, dst: u16) -> Vec<Expired<T>> {
        let keys: Vec<_> = self.entries.keys().filter(|k| k.0 == dst).copied().collect();
        keys.into_iter()
            .filter_map(|key| {
                self.entries.remove(&key).map(|e| Expired {
                    dst: key.0,
                    opcode: key.1,
                    payload: e.payload,
                })
            })
            .collect()
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{CONFIG_APPKEY_STATUS, GENERIC_ONOFF_STATUS};
    use std::time::Duration;

    #[test]
    fn test_resolve_exactly_once() {
        let now = Instant::now();
        let mut pending = PendingRequests::new();
        pending.insert(0x0002, CONFIG_APPKEY_STATUS, now, "add");
        assert_eq!(pending.resolve(0x0003, CONFIG_APPKEY_STATUS), None);
        assert_eq!(pending.resolve(0x0002, GENERIC_ONOFF_STATUS), None);
        assert_eq!(pending.resolve(0x0002, CONFIG_APPKEY_STATUS), Some("add"));
        assert_eq!(pending.resolve(0x0002, CONFIG_APPKEY_STATUS), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_expire_drains_overdue_only() {
        let now = Instant::now();
        let mut pending = PendingRequests::new();
        pending.insert(0x0002, CONFIG_APPKEY_STATUS, now + Duration::from_secs(1), 1);
        pending.insert(0x0003, CONFIG_APPKEY_STATUS, now + Duration::from_secs(5), 2);
        assert_eq!(pending.next_deadline(), Some(now + Duration::from_secs(1)));

        assert!(pending.expire(now).is_empty());
        let expired = pending.expire(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].dst, 0x0002);
        assert_eq!(expired[0].payload, 1);
        assert!(pending.expire(now + Duration::from_secs(1)).is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_supersede_and_cancel() {
        let now = Instant::now();
        let mut pending = PendingRequests::new();
        assert_eq!(pending.insert(0x0002, GENERIC_ONOFF_STATUS, now, 1), None);
        assert_eq!(pending.insert(0x0002, GENERIC_ONOFF_STATUS, now, 2), Some(1));
        pending.insert(0x0004, GENERIC_ONOFF_STATUS, now, 3);
        pending.insert(0x0004, CONFIG_APPKEY_STATUS, now, 4);

        let mut for_four: Vec<_> = pending
            .cancel_destination(0x0004)
            .into_iter()
            .map(|e| e.payload)
            .collect();
        for_four.sort();
        assert_eq!(for_four, vec![3, 4]);

        let rest = pending.cancel_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, 2);
        assert!(pending.is_empty());
        assert_eq!(pending.next_deadline(), None);
    }
}
