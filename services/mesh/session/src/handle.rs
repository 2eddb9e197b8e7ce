//! Clonable front end of a session actor.

use bytes::Bytes;
use mesh_access::MeshMessage;
use mesh_provisioning::DeviceDescriptor;
use mesh_transport::{AccessKey, NetworkContext, ProvisionedNode};
use tokio::sync::{mpsc, oneshot};

use crate::MeshError;

type Reply<T> = oneshot::Sender<Result<T, MeshError>>;

/// Work queued for the actor
pub(crate) enum Command {
    Provision {
        device: DeviceDescriptor,
        reply: Reply<ProvisionedNode>,
    },
    SetAuthValue {
        value: String,
        reply: Reply<()>,
    },
    AbortProvisioning {
        reply: oneshot::Sender<bool>,
    },
    Send {
        message: MeshMessage,
        dst: u16,
        key: AccessKey,
        reply: Reply<()>,
    },
    SendAcknowledged {
        message: MeshMessage,
        dst: u16,
        key: AccessKey,
        reply: Reply<MeshMessage>,
    },
    Deliver {
        bytes: Bytes,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<NetworkContext>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running [`MeshSession`](crate::MeshSession)
///
/// Every method queues one command; commands are processed in order by the
/// session task.
#[derive(Clone, Debug)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
}

impl MeshHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Provision a device, resolving once it is part of the network
    ///
    /// Fails with [`MeshError::Busy`] while another device is being
    /// provisioned.
    pub async fn provision(&self, device: DeviceDescriptor) -> Result<ProvisionedNode, MeshError> {
        self.request(|reply| Command::Provision { device, reply }).await?
    }

    /// Enter the value the device is showing (output OOB)
    pub async fn set_auth_value(&self, value: impl Into<String>) -> Result<(), MeshError> {
        let value = value.into();
        self.request(|reply| Command::SetAuthValue { value, reply })
            .await?
    }

    /// Abandon the active provisioning attempt; `false` if there was none
    pub async fn abort_provisioning(&self) -> Result<bool, MeshError> {
        self.request(|reply| Command::AbortProvisioning { reply })
            .await
    }

    /// Send a message without waiting for a reply
    pub async fn send(&self, message: MeshMessage, dst: u16, key: AccessKey) -> Result<(), MeshError> {
        self.request(|reply| Command::Send {
            message,
            dst,
            key,
            reply,
        })
        .await?
    }

    /// Send a message and wait for its status
    ///
    /// Resolves with the status message, with an `OperationTimedOut` access
    /// error once the request timeout passes, or with `Cancelled` on
    /// disconnect.
    pub async fn send_acknowledged(
        &self,
        message: MeshMessage,
        dst: u16,
        key: AccessKey,
    ) -> Result<MeshMessage, MeshError> {
        self.request(|reply| Command::SendAcknowledged {
            message,
            dst,
            key,
            reply,
        })
        .await?
    }

    /// Feed bytes received from the bearer
    pub async fn deliver(&self, bytes: impl Into<Bytes>) -> Result<(), MeshError> {
        self.commands
            .send(Command::Deliver {
                bytes: bytes.into(),
            })
            .await
            .map_err(|_| MeshError::SessionClosed)
    }

    /// The bearer went away: cancel every timer, transaction and request
    pub async fn disconnect(&self) -> Result<(), MeshError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Copy of the network state
    pub async fn snapshot(&self) -> Result<NetworkContext, MeshError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Cancel outstanding work, persist, and stop the session task
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
