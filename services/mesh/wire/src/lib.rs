//! Bit-exact codecs for every mesh PDU class.
//!
//! This crate turns bytes into typed PDUs and back. It owns the layouts and
//! the per-layer nonces; it holds no state and applies no policy (replay,
//! segmentation timers and key selection live in `mesh-transport`).
//!
//! ## Features
//!
//! - **Network PDU**: header obfuscation, AES-CCM with 32/64-bit NetMIC
//! - **Lower Transport**: segmented and unsegmented access/control PDUs, Segment Ack
//! - **Upper Transport**: application and device nonces, TransMIC sealing
//! - **Access**: 1, 2 and 3-byte opcodes
//! - **Provisioning**: all ten provisioning PDUs and the provisioning data block
//! - **Beacons**: secure network beacon authentication, unprovisioned device beacon
//! - **Proxy**: `SAR|Type` framing with MTU-driven segmentation and reassembly
//!
//! ## Layering
//!
//! ```text
//! +-------------------+  AccessPdu       opcode ‖ parameters
//! | Access            |
//! +-------------------+  upper PDU       AES-CCM(app/device key) ‖ TransMIC
//! | Upper Transport   |
//! +-------------------+  LowerTransportPdu  SEG|AKF|AID [SZMIC|SeqZero|SegO|SegN]
//! | Lower Transport   |
//! +-------------------+  network PDU     IVI|NID ‖ obfuscated ‖ encrypted ‖ NetMIC
//! | Network           |
//! +-------------------+  proxy PDU       SAR|Type ‖ fragment
//! | Proxy (GATT)      |
//! +-------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod address;
pub mod beacon;
pub mod error;
pub mod lower;
pub mod network;
pub mod provisioning;
pub mod proxy;
pub mod upper;

// Re-export main types
pub use access::{AccessPdu, Opcode, MAX_ACCESS_PAYLOAD};
pub use address::{is_unicast, MeshAddress, ALL_FRIENDS, ALL_NODES, ALL_PROXIES, ALL_RELAYS};
pub use beacon::{BeaconFlags, MeshBeacon, SecureNetworkBeacon, UnprovisionedDeviceBeacon};
pub use error::WireError;
pub use lower::{
    LowerTransportPdu, SegmentAck, SegmentInfo, ACCESS_SEGMENT_SIZE, CONTROL_SEGMENT_SIZE,
    MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_SIZE, SEGMENT_ACK_OPCODE, SEQ_ZERO_MASK,
};
pub use network::{
    decode_network_pdu, encode_network_pdu, network_nonce, NetworkHeader, RawNetworkPdu,
    MAX_SEQUENCE, MAX_TTL,
};
pub use provisioning::{
    Algorithms, AuthMethod, Capabilities, FailureCode, InputOobActions, OutputOobActions,
    ProvisioningData, ProvisioningPdu, ProvisioningPduType, PublicKeyType, StartParameters,
    StaticOobType, PROVISIONING_PUBLIC_KEY_SIZE, PROVISIONING_VALUE_SIZE,
};
pub use proxy::{ProxyPduType, ProxyReassembler, ProxySegmenter, DEFAULT_PROXY_MTU};
pub use upper::{open_access, seal_access, upper_nonce, NonceKind};
