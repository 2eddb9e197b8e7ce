//! Provisioning state machines for mesh.
//!
//! [`Provisioner`] drives a device from `Idle` to `Complete`: Invite,
//! Capabilities, Start and public key exchange, optional OOB authentication,
//! confirmation and random exchange, then the encrypted provisioning data.
//! [`Provisionee`] is the matching device role.
//!
//! Both are sans-IO: received PDUs go in through `receive`, and encoded
//! PDUs, state changes and results come out as [`ProvisioningEvent`]s.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
mod handshake;
pub mod provisionee;
pub mod provisioner;
pub mod state;

pub use auth::{select_auth, validate_start, AuthValue, OobValueKind, MAX_OOB_SIZE};
pub use config::ProvisioningConfig;
pub use error::ProvisioningError;
pub use mesh_wire::FailureCode;
pub use provisionee::Provisionee;
pub use provisioner::{DeviceDescriptor, ProvisioningParameters, Provisioner};
pub use state::{ProvisioningEvent, ProvisioningState};
