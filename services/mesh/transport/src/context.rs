//! Per-network state owned by a session.
//!
//! `NetworkContext` is plain data: keys, nodes, the IV index, the local
//! sequence counter and the replay list. It is the snapshot handed to
//! storage and is passed by `&mut` into every transport entry point.

use mesh_crypto::Key128;
use mesh_wire::{is_unicast, MeshAddress, MAX_SEQUENCE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::iv::{IvIndex, IvUpdate};
use crate::keys::{ApplicationKey, NetworkKey};
use crate::node::ProvisionedNode;
use crate::replay::ReplayList;
use crate::TransportError;

/// Highest unicast address
pub const MAX_UNICAST_ADDRESS: u16 = 0x7FFF;
/// Default TTL for locally originated messages
pub const DEFAULT_TTL: u8 = 5;

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn default_element_count() -> u8 {
    1
}

/// Keys, nodes and counters of one mesh network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    /// Network name, also the storage key
    pub name: String,
    /// Local primary element address
    pub unicast_address: u16,
    /// Number of local elements
    #[serde(default = "default_element_count")]
    pub element_count: u8,
    /// Local device key when this context is a provisioned node
    #[serde(default, with = "crate::keys::hex_key_opt", skip_serializing_if = "Option::is_none")]
    pub device_key: Option<Key128>,
    /// Current IV index
    #[serde(default)]
    pub iv_index: IvIndex,
    /// Next sequence number to issue
    #[serde(default)]
    pub next_seq: u32,
    /// TTL for messages that do not set one
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    network_keys: BTreeMap<u16, NetworkKey>,
    #[serde(default)]
    app_keys: BTreeMap<u16, ApplicationKey>,
    #[serde(default)]
    nodes: BTreeMap<u16, ProvisionedNode>,
    #[serde(default)]
    replay: ReplayList,
}

impl NetworkContext {
    /// A context with one network key
    pub fn new(name: impl Into<String>, unicast_address: u16, primary_key: NetworkKey) -> Self {
        let mut network_keys = BTreeMap::new();
        network_keys.insert(primary_key.index(), primary_key);
        Self {
            name: name.into(),
            unicast_address,
            element_count: 1,
            device_key: None,
            iv_index: IvIndex::default(),
            next_seq: 0,
            default_ttl: DEFAULT_TTL,
            network_keys,
            app_keys: BTreeMap::new(),
            nodes: BTreeMap::new(),
            replay: ReplayList::new(),
        }
    }

    // --- keys ---

    /// Add or replace a network key
    pub fn add_network_key(&mut self, key: NetworkKey) {
        info!("network {}: net key {} added", self.name, key.index());
        self.network_keys.insert(key.index(), key);
    }

    /// Look up a network key
    pub fn network_key(&self, index: u16) -> Result<&NetworkKey, TransportError> {
        self.network_keys
            .get(&index)
            .ok_or(TransportError::UnknownNetworkKey(index))
    }

    /// Look up a network key for key refresh
    pub fn network_key_mut(&mut self, index: u16) -> Result<&mut NetworkKey, TransportError> {
        self.network_keys
            .get_mut(&index)
            .ok_or(TransportError::UnknownNetworkKey(index))
    }

    /// All network keys by index
    pub fn network_keys(&self) -> impl Iterator<Item = &NetworkKey> {
        self.network_keys.values()
    }

    /// Lowest-index network key
    pub fn primary_network_key(&self) -> Result<&NetworkKey, TransportError> {
        self.network_keys
            .values()
            .next()
            .ok_or(TransportError::UnknownNetworkKey(0))
    }

    /// Add an application key; its network key must exist
    pub fn add_app_key(&mut self, key: ApplicationKey) -> Result<(), TransportError> {
        self.network_key(key.bound_net_key())?;
        info!(
            "network {}: app key {} added (net key {})",
            self.name,
            key.index(),
            key.bound_net_key()
        );
        self.app_keys.insert(key.index(), key);
        Ok(())
    }

    /// Look up an application key
    pub fn app_key(&self, index: u16) -> Result<&ApplicationKey, TransportError> {
        self.app_keys
            .get(&index)
            .ok_or(TransportError::UnknownAppKey(index))
    }

    /// All application keys by index
    pub fn app_keys(&self) -> impl Iterator<Item = &ApplicationKey> {
        self.app_keys.values()
    }

    // --- nodes ---

    /// Register a provisioned node; its address range must be free
    pub fn add_node(&mut self, node: ProvisionedNode) -> Result<(), TransportError> {
        if !self.range_is_free(node.unicast_address, node.element_count) {
            return Err(TransportError::AddressUnavailable(node.element_count));
        }
        info!(
            "network {}: node {} added at {:#06x}",
            self.name, node.name, node.unicast_address
        );
        self.nodes.insert(node.unicast_address, node);
        Ok(())
    }

    /// Remove the node owning `address`
    pub fn remove_node(&mut self, address: u16) -> Option<ProvisionedNode> {
        let primary = self.node_for_address(address)?.unicast_address;
        let node = self.nodes.remove(&primary)?;
        for element in node.unicast_address..=node.last_address() {
            self.replay.remove(element);
        }
        info!("network {}: node {:#06x} removed", self.name, primary);
        Some(node)
    }

    /// The node owning `address`, if any
    pub fn node_for_address(&self, address: u16) -> Option<&ProvisionedNode> {
        self.nodes
            .range(..=address)
            .next_back()
            .map(|(_, node)| node)
            .filter(|node| node.contains_address(address))
    }

    /// Mutable access to the node owning `address`
    pub fn node_mut(&mut self, address: u16) -> Option<&mut ProvisionedNode> {
        let primary = self.node_for_address(address)?.unicast_address;
        self.nodes.get_mut(&primary)
    }

    /// All provisioned nodes by address
    pub fn nodes(&self) -> impl Iterator<Item = &ProvisionedNode> {
        self.nodes.values()
    }

    /// Lowest free unicast range of `element_count` addresses
    pub fn allocate_unicast(&self, element_count: u8) -> Result<u16, TransportError> {
        let count = element_count.max(1) as u32;
        let mut candidate: u32 = 1;
        while candidate + count - 1 <= MAX_UNICAST_ADDRESS as u32 {
            let start = candidate as u16;
            if self.range_is_free(start, element_count.max(1)) {
                debug!("allocated {:#06x} for {} elements", start, count);
                return Ok(start);
            }
            candidate += 1;
        }
        Err(TransportError::AddressUnavailable(element_count))
    }

    fn range_is_free(&self, start: u16, element_count: u8) -> bool {
        let count = element_count.max(1) as u32;
        let end = start as u32 + count - 1;
        if start == 0 || end > MAX_UNICAST_ADDRESS as u32 {
            return false;
        }
        let overlaps = |first: u16, last: u16| start as u32 <= last as u32 && first as u32 <= end;
        if overlaps(self.unicast_address, self.last_local_address()) {
            return false;
        }
        !self
            .nodes
            .values()
            .any(|n| overlaps(n.unicast_address, n.last_address()))
    }

    // --- addresses ---

    fn last_local_address(&self) -> u16 {
        self.unicast_address + self.element_count.saturating_sub(1) as u16
    }

    /// Whether `address` is one of the local elements
    pub fn is_local_address(&self, address: u16) -> bool {
        (self.unicast_address..=self.last_local_address()).contains(&address)
    }

    /// Whether a PDU addressed to `dst` is for this context
    pub fn accepts_destination(&self, dst: u16) -> bool {
        match MeshAddress::from(dst) {
            MeshAddress::Unassigned => false,
            MeshAddress::Unicast(addr) => self.is_local_address(addr),
            MeshAddress::Group(_) | MeshAddress::Virtual(_) => true,
        }
    }

    /// Device key used for a peer: the node's key, else the local one
    pub fn device_key_for(&self, peer: u16) -> Option<&Key128> {
        self.node_for_address(peer)
            .map(|n| &n.device_key)
            .or(self.device_key.as_ref())
    }

    // --- sequence and iv ---

    /// Sequence numbers left before the space is exhausted
    pub fn remaining_sequences(&self) -> u32 {
        (MAX_SEQUENCE + 1).saturating_sub(self.next_seq)
    }

    /// Issue the next sequence number
    pub fn next_sequence(&mut self) -> Result<u32, TransportError> {
        if self.next_seq > MAX_SEQUENCE {
            return Err(TransportError::SequenceExhausted);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Fail unless `count` sequence numbers can still be issued
    pub fn ensure_sequences(&self, count: usize) -> Result<(), TransportError> {
        if (self.remaining_sequences() as usize) < count {
            return Err(TransportError::SequenceExhausted);
        }
        Ok(())
    }

    /// Replay protection list
    pub fn replay(&self) -> &ReplayList {
        &self.replay
    }

    pub(crate) fn replay_mut(&mut self) -> &mut ReplayList {
        &mut self.replay
    }

    /// Apply beacon IV fields; the sequence restarts when the transmit index moves
    pub fn apply_iv_beacon(&mut self, index: u32, update_flag: bool) -> Result<IvUpdate, TransportError> {
        let before = self.iv_index.transmit_index();
        let outcome = self.iv_index.apply_beacon(index, update_flag)?;
        self.reset_sequence_if_moved(before);
        Ok(outcome)
    }

    /// Start an IV update locally
    pub fn begin_iv_update(&mut self) {
        let before = self.iv_index.transmit_index();
        self.iv_index.begin_update();
        self.reset_sequence_if_moved(before);
    }

    /// Complete an IV update locally
    pub fn complete_iv_update(&mut self) {
        let before = self.iv_index.transmit_index();
        self.iv_index.complete_update();
        self.reset_sequence_if_moved(before);
    }

    fn reset_sequence_if_moved(&mut self, before: u32) {
        if self.iv_index.transmit_index() != before {
            debug!(
                "transmit iv index {} -> {}, sequence reset",
                before,
                self.iv_index.transmit_index()
            );
            self.next_seq = 0;
        }
    }
}

/// Whether `address` may be used as a message source
pub(crate) fn valid_source(address: u16) -> bool {
    is_unicast(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";

    fn context() -> NetworkContext {
        NetworkContext::new("home", 0x0001, NetworkKey::from_hex(0, NET_KEY).unwrap())
    }

    fn node(addr: u16, elements: u8) -> ProvisionedNode {
        ProvisionedNode::new("n", Uuid::new_v4(), addr, elements, 0, [1; 16])
    }

    #[test]
    fn test_app_key_requires_network_key() {
        let mut ctx = context();
        let app = ApplicationKey::new(0, 7, &[2; 16]).unwrap();
        assert_eq!(ctx.add_app_key(app), Err(TransportError::UnknownNetworkKey(7)));

        let app = ApplicationKey::new(0, 0, &[2; 16]).unwrap();
        ctx.add_app_key(app).unwrap();
        assert!(ctx.app_key(0).is_ok());
        assert_eq!(ctx.app_key(1).unwrap_err(), TransportError::UnknownAppKey(1));
    }

    #[test]
    fn test_unicast_allocation_skips_used_ranges() {
        let mut ctx = context();
        assert_eq!(ctx.allocate_unicast(2).unwrap(), 0x0002);

        ctx.add_node(node(0x0002, 2)).unwrap();
        assert_eq!(ctx.allocate_unicast(3).unwrap(), 0x0004);
        ctx.add_node(node(0x0004, 3)).unwrap();

        // Overlapping ranges are rejected
        assert_eq!(
            ctx.add_node(node(0x0003, 1)),
            Err(TransportError::AddressUnavailable(1))
        );
        assert!(ctx.add_node(node(0x0001, 1)).is_err());

        assert_eq!(ctx.node_for_address(0x0006).unwrap().unicast_address, 0x0004);
        assert!(ctx.node_for_address(0x0007).is_none());

        ctx.remove_node(0x0005).unwrap();
        assert_eq!(ctx.allocate_unicast(1).unwrap(), 0x0004);
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut ctx = context();
        ctx.next_seq = MAX_SEQUENCE;
        assert!(ctx.ensure_sequences(1).is_ok());
        assert!(ctx.ensure_sequences(2).is_err());
        assert_eq!(ctx.next_sequence(), Ok(MAX_SEQUENCE));
        assert_eq!(ctx.next_sequence(), Err(TransportError::SequenceExhausted));
        assert_eq!(ctx.remaining_sequences(), 0);
    }

    #[test]
    fn test_iv_update_resets_sequence_on_completion() {
        let mut ctx = context();
        ctx.iv_index = IvIndex::new(5);
        ctx.next_seq = 1000;

        ctx.begin_iv_update();
        assert_eq!(ctx.next_seq, 1000);
        ctx.complete_iv_update();
        assert_eq!(ctx.next_seq, 0);
        assert_eq!(ctx.iv_index.transmit_index(), 6);

        ctx.next_seq = 10;
        ctx.apply_iv_beacon(9, false).unwrap();
        assert_eq!(ctx.next_seq, 0);
    }

    #[test]
    fn test_destination_filter() {
        let mut ctx = context();
        ctx.element_count = 2;
        assert!(ctx.accepts_destination(0x0001));
        assert!(ctx.accepts_destination(0x0002));
        assert!(!ctx.accepts_destination(0x0003));
        assert!(ctx.accepts_destination(0xFFFF));
        assert!(ctx.accepts_destination(0xC001));
        assert!(!ctx.accepts_destination(0x0000));
    }

    #[test]
    fn test_snapshot_serde() {
        let mut ctx = context();
        ctx.add_app_key(ApplicationKey::new(1, 0, &[3; 16]).unwrap())
            .unwrap();
        ctx.add_node(node(0x0010, 1)).unwrap();
        ctx.replay_mut().commit(0x0010, 0, 44);
        ctx.next_seq = 99;

        let json = serde_json::to_string(&ctx).unwrap();
        let back: NetworkContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
        assert_eq!(back.replay().last(0x0010), Some((0, 44)));
    }
}
