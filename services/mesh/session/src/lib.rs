//! Session actor for mesh: the single processing queue in front of the
//! transport engine, the provisioner and the access layer.
//!
//! A [`MeshSession`] task owns all mutable network state. Callers hold
//! [`MeshHandle`]s, which queue commands and await their answers; the bearer
//! feeds received bytes through [`MeshHandle::deliver`] and drains
//! [`SessionChannels::outbound`]. Everything else the session has to say
//! arrives on [`SessionChannels::events`].
//!
//! ## Features
//!
//! - **Provisioning**: one device at a time, addresses allocated from the
//!   network, the result persisted before the caller hears about it
//! - **Acknowledged requests**: resolved by the matching status, by the request
//!   timeout, or by `Cancelled` on disconnect
//! - **Node records**: configuration statuses update the provisioned node
//! - **Proxy framing**: outbound PDUs split to the configured MTU
//! - **Loopback device**: [`LoopbackNode`] simulates a light for tests and demos
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_access::MeshMessage;
//! use mesh_session::{LoopbackNode, MeshEvent, MeshSession, SessionConfig};
//! use mesh_storage::MeshStore;
//! use mesh_transport::{AccessKey, NetworkContext, NetworkKey};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SessionConfig::default();
//! let key = NetworkKey::new(0, &[0x11; 16])?;
//! let context = NetworkContext::new("home", 0x0001, key);
//!
//! let (handle, mut channels) = MeshSession::spawn(config.clone(), context, MeshStore::in_memory())?;
//!
//! // Wire an in-process device to the bearer side
//! let lamp = LoopbackNode::light("lamp", &config)?;
//! let device = lamp.device();
//! let _bearer = lamp.spawn(handle.clone(), channels.outbound);
//!
//! let node = handle.provision(device).await?;
//! let status = handle
//!     .send_acknowledged(MeshMessage::CompositionDataGet { page: 0 }, node.unicast_address, AccessKey::Device)
//!     .await?;
//! println!("{:?}", status);
//!
//! while let Some(event) = channels.events.recv().await {
//!     match event {
//!         MeshEvent::NodeUpdated(node) => println!("node {:#06x} updated", node.unicast_address),
//!         MeshEvent::Failure(e) => println!("failure: {}", e),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod loopback;
pub mod session;

pub use config::SessionConfig;
pub use error::{ErrorKind, MeshError};
pub use event::MeshEvent;
pub use handle::MeshHandle;
pub use loopback::{light_composition, LoopbackNode};
pub use session::{MeshSession, SessionChannels};
