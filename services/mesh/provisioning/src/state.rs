//! Provisioning states and the events both roles emit.

use bytes::Bytes;
use mesh_crypto::Key128;
use mesh_transport::ProvisionedNode;
use mesh_wire::{AuthMethod, Capabilities, ProvisioningData};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProvisioningError;

/// Progress of one provisioning attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Nothing sent yet
    Idle,
    /// Invite exchanged
    Invite,
    /// Capabilities known; waiting for Start
    Capabilities,
    /// Public keys being exchanged
    PublicKeyExchange,
    /// Waiting for an OOB value
    Authentication,
    /// Confirmation values being exchanged
    Confirmation,
    /// Random values being exchanged
    RandomExchange,
    /// Encrypted provisioning data sent, waiting for Complete
    ProvisioningDataExchange,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed,
}

impl ProvisioningState {
    /// Whether no further input is accepted
    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisioningState::Complete | ProvisioningState::Failed)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Output of a provisioning state machine
#[derive(Debug, Clone)]
pub enum ProvisioningEvent {
    /// Encoded provisioning PDU for the bearer
    Transmit(Bytes),
    /// The state machine moved
    StateChanged(ProvisioningState),
    /// Device capabilities arrived
    CapabilitiesReceived(Capabilities),
    /// A unicast range must be assigned with `assign_address`
    AddressRequired {
        /// Elements the device reported
        element_count: u8,
    },
    /// The user must enter the value the peer is showing
    AuthValueRequired {
        /// Negotiated method
        method: AuthMethod,
        /// Action index within the method's action set
        action: u8,
        /// Digits or characters expected
        size: u8,
    },
    /// A value to show the user, who enters it on the peer
    DisplayAuthValue(String),
    /// Provisioner role finished
    NodeProvisioned(ProvisionedNode),
    /// Device role finished
    DeviceProvisioned {
        /// Decrypted provisioning data
        data: ProvisioningData,
        /// Device key shared with the provisioner
        device_key: Key128,
    },
    /// Terminal failure
    Failed(ProvisioningError),
}
