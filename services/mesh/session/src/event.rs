//! Events delivered to the session owner.

use mesh_access::MeshMessage;
use mesh_provisioning::ProvisioningState;
use mesh_transport::{AccessKey, IvIndex, ProvisionedNode};
use mesh_wire::AuthMethod;
use uuid::Uuid;

use crate::MeshError;

/// Everything a session reports, in processing order
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A decoded access message addressed to us
    Message {
        /// Sending element
        src: u16,
        /// Destination (local unicast, group or virtual)
        dst: u16,
        /// Key that secured the message
        key: AccessKey,
        /// The message
        message: MeshMessage,
    },
    /// The active provisioning attempt changed state
    ProvisioningState(ProvisioningState),
    /// The user must enter the value the device is showing
    AuthValueRequired {
        /// Negotiated method
        method: AuthMethod,
        /// Action index within the method's action set
        action: u8,
        /// Digits or characters expected
        size: u8,
    },
    /// A value to show the user, who enters it on the device
    DisplayAuthValue(String),
    /// A device completed provisioning and was added to the network
    NodeProvisioned(ProvisionedNode),
    /// A node record changed after a configuration status
    NodeUpdated(ProvisionedNode),
    /// A node confirmed a reset and was removed
    NodeRemoved(u16),
    /// An unprovisioned device beacon was heard
    UnprovisionedDevice {
        /// Device UUID
        uuid: Uuid,
        /// OOB information bit field
        oob_information: u16,
    },
    /// A PDU was dropped, a transaction failed, or provisioning failed
    Failure(MeshError),
    /// The IV index changed
    IvIndexUpdated(IvIndex),
    /// Outstanding work was cancelled by a disconnect
    Disconnected,
}
