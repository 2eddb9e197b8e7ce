//! Provisioned node records.

use chrono::{DateTime, Utc};
use mesh_crypto::Key128;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Model identifier: 16-bit SIG model or 32-bit vendor model (company in the high half)
pub type ModelId = u32;

/// A model bound to an application key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Element address
    pub element: u16,
    /// Model identifier
    pub model_id: ModelId,
    /// Bound application key index
    pub app_key_index: u16,
}

/// A model subscribed to a group or virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Element address
    pub element: u16,
    /// Model identifier
    pub model_id: ModelId,
    /// Subscribed address
    pub address: u16,
}

/// A device that completed provisioning into this network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNode {
    /// Human readable name
    pub name: String,
    /// Device UUID from the unprovisioned beacon
    pub uuid: Uuid,
    /// Primary element address
    pub unicast_address: u16,
    /// Number of elements (consecutive addresses)
    pub element_count: u8,
    /// Network key the node was provisioned with
    pub net_key_index: u16,
    /// Device key
    #[serde(with = "crate::keys::hex_key")]
    pub device_key: Key128,
    /// Raw composition data page 0, once received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<Vec<u8>>,
    /// Application keys known to be added to the node
    #[serde(default)]
    pub app_keys: BTreeSet<u16>,
    /// Model to app-key bindings
    #[serde(default)]
    pub bindings: Vec<ModelBinding>,
    /// Model subscriptions
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Default TTL used when messaging the node
    pub ttl: u8,
    /// When provisioning completed
    pub provisioned_at: DateTime<Utc>,
}

impl ProvisionedNode {
    /// A freshly provisioned node with no configuration yet
    pub fn new(
        name: impl Into<String>,
        uuid: Uuid,
        unicast_address: u16,
        element_count: u8,
        net_key_index: u16,
        device_key: Key128,
    ) -> Self {
        Self {
            name: name.into(),
            uuid,
            unicast_address,
            element_count: element_count.max(1),
            net_key_index,
            device_key,
            composition: None,
            app_keys: BTreeSet::new(),
            bindings: Vec::new(),
            subscriptions: Vec::new(),
            ttl: 5,
            provisioned_at: Utc::now(),
        }
    }

    /// Last unicast address owned by the node
    pub fn last_address(&self) -> u16 {
        self.unicast_address + self.element_count.saturating_sub(1) as u16
    }

    /// Whether `address` is one of the node's element addresses
    pub fn contains_address(&self, address: u16) -> bool {
        (self.unicast_address..=self.last_address()).contains(&address)
    }

    /// Record a model binding (idempotent)
    pub fn bind(&mut self, binding: ModelBinding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Record a subscription (idempotent)
    pub fn subscribe(&mut self, subscription: Subscription) {
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ProvisionedNode {
        ProvisionedNode::new("lamp", Uuid::nil(), 0x0010, 3, 0, [7; 16])
    }

    #[test]
    fn test_address_range() {
        let node = node();
        assert_eq!(node.last_address(), 0x0012);
        assert!(node.contains_address(0x0010));
        assert!(node.contains_address(0x0012));
        assert!(!node.contains_address(0x0013));
        assert!(!node.contains_address(0x000F));
    }

    #[test]
    fn test_bindings_idempotent() {
        let mut node = node();
        let binding = ModelBinding {
            element: 0x0010,
            model_id: 0x1000,
            app_key_index: 1,
        };
        node.bind(binding);
        node.bind(binding);
        assert_eq!(node.bindings.len(), 1);

        let sub = Subscription {
            element: 0x0011,
            model_id: 0x1000,
            address: 0xC000,
        };
        node.subscribe(sub);
        node.subscribe(sub);
        assert_eq!(node.subscriptions, vec![sub]);
    }

    #[test]
    fn test_serde_keeps_device_key_as_hex() {
        let mut node = node();
        node.composition = Some(vec![1, 2, 3]);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains(&"07".repeat(16)));
        let back: ProvisionedNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
