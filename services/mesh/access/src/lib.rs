//! Access layer for mesh.
//!
//! - [`MeshMessage`]: closed set of typed configuration, generic and vendor
//!   messages with their parameter layouts
//! - [`MessageCatalog`]: opcode to decoder registry, extensible with vendor
//!   opcodes
//! - [`StatusMessage`]: status code accessor shared by config status messages
//! - [`PendingRequests`]: acknowledged requests awaiting their status

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod error;
pub mod message;
pub mod opcodes;
pub mod params;
pub mod pending;
pub mod status;

pub use catalog::{DecodeFn, MessageCatalog};
pub use error::AccessError;
pub use message::{
    ConfigAppKeyAdd, ConfigAppKeyStatus, ConfigCompositionDataStatus, ConfigModelAppBind,
    ConfigModelAppStatus, ConfigModelSubscriptionAdd, ConfigModelSubscriptionStatus,
    GenericLevelSet, GenericLevelStatus, GenericOnOffSet, GenericOnOffStatus, MeshMessage,
    VendorMessage,
};
pub use params::{
    pack_key_indexes, unpack_key_indexes, CompositionData, Element, Features, ModelIdentifier,
    StepResolution, Transition, TransitionTime,
};
pub use pending::{Expired, PendingRequests};
pub use status::{ConfigStatus, StatusEnvelope, StatusMessage};
