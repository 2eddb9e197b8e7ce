//! Network context and transport engine for mesh.
//!
//! [`NetworkContext`] is the per-network state (keys, nodes, IV index,
//! sequence counter, replay list) that a session owns and persists.
//! [`TransportEngine`] is a sans-IO state machine layered on top of it:
//!
//! - outbound: upper transport encryption, segmentation into 12-byte (access)
//!   or 8-byte (control) segments, network encryption and obfuscation
//! - inbound: network key trial by NID, replay protection, reassembly,
//!   upper transport decryption by AID or device key
//! - segment acknowledgments with retransmission and timeouts
//! - secure network beacons (IV update and key refresh)
//!
//! The caller drives time explicitly:
//!
//! ```text
//! loop {
//!     engine.receive_network_pdu(&mut ctx, now, &bytes)?;   // or send_access(...)
//!     while let Some(out) = engine.poll_output() { ... }
//!     sleep_until(engine.poll_timeout());
//!     engine.handle_timeout(&mut ctx, now);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod iv;
pub mod keys;
pub mod node;
pub mod replay;
mod sar;

pub use config::TransportConfig;
pub use context::{NetworkContext, DEFAULT_TTL, MAX_UNICAST_ADDRESS};
pub use engine::{
    AccessKey, IncomingAccess, IncomingControl, OutgoingAccess, OutgoingControl, SendOutcome,
    TransportEngine, TransportOutput, MAX_UNSEGMENTED_ACCESS_PAYLOAD,
};
pub use error::TransportError;
pub use iv::{IvIndex, IvUpdate};
pub use keys::{ApplicationKey, KeyRefreshPhase, NetworkKey, MAX_KEY_INDEX};
pub use node::{ModelBinding, ModelId, ProvisionedNode, Subscription};
pub use replay::ReplayList;
