//! Session error surface.
//!
//! Every crate in the stack has its own error enum; [`MeshError`] wraps them
//! and [`MeshError::kind`] flattens them into the caller-facing [`ErrorKind`].

use mesh_access::AccessError;
use mesh_crypto::CryptoError;
use mesh_provisioning::{FailureCode, ProvisioningError};
use mesh_storage::StorageError;
use mesh_transport::TransportError;
use mesh_wire::WireError;
use std::fmt;
use thiserror::Error;

/// Errors reported by a mesh session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Network, lower or upper transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Access layer failure
    #[error("access: {0}")]
    Access(#[from] AccessError),

    /// Provisioning failure
    #[error("provisioning: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// Bearer framing failure
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Key material or cipher failure
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    /// The store rejected a read or write
    #[error("storage: {0}")]
    Storage(String),

    /// A provisioning session is already active
    #[error("a provisioning session is already active")]
    Busy,

    /// The session task has stopped
    #[error("session closed")]
    SessionClosed,
}

impl From<StorageError> for MeshError {
    fn from(e: StorageError) -> Self {
        MeshError::Storage(e.to_string())
    }
}

/// Flat classification of [`MeshError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Truncated buffer, reserved bits or bad field values
    MalformedPdu,
    /// Key material of the wrong size
    InvalidKeyLength,
    /// More than 32 segments needed
    PayloadTooLarge,
    /// No key authenticated the PDU
    DecryptionFailed,
    /// Sequence number not newer than the last accepted one
    ReplayDetected,
    /// Provisioning confirmation mismatch
    ConfirmationFailed,
    /// No decoder for the opcode
    UnknownOpcode,
    /// Segment acknowledgment, request or provisioning deadline passed
    OperationTimedOut,
    /// Incomplete-transaction timer expired
    SegmentsNotReceivedTimeout,
    /// Dropped by disconnect or abort
    Cancelled,
    /// Provisioning already in progress
    Busy,
    /// Sequence space used up
    SequenceExhausted,
    /// Network or application key not known
    UnknownKey,
    /// Address not owned by any node
    UnknownNode,
    /// Persistence failure
    Storage,
    /// Provisioning failed with the given code
    Provisioning(FailureCode),
    /// The session task has stopped
    SessionClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Provisioning(code) => write!(f, "Provisioning({:?})", code),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl MeshError {
    /// Caller-facing classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Transport(e) => transport_kind(e),
            MeshError::Access(e) => match e {
                AccessError::Malformed(w) => wire_kind(w),
                AccessError::UnknownOpcode(_) => ErrorKind::UnknownOpcode,
                AccessError::Length { .. } | AccessError::InvalidParameters { .. } => {
                    ErrorKind::MalformedPdu
                }
                AccessError::InvalidKeyIndex(_) => ErrorKind::UnknownKey,
                AccessError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
                AccessError::Cancelled => ErrorKind::Cancelled,
            },
            MeshError::Provisioning(e) => match e {
                ProvisioningError::Malformed(w) => wire_kind(w),
                ProvisioningError::ConfirmationFailed
                | ProvisioningError::Remote(FailureCode::ConfirmationFailed) => {
                    ErrorKind::ConfirmationFailed
                }
                ProvisioningError::DecryptionFailed
                | ProvisioningError::Remote(FailureCode::DecryptionFailed) => {
                    ErrorKind::DecryptionFailed
                }
                ProvisioningError::Timeout => ErrorKind::OperationTimedOut,
                ProvisioningError::Cancelled => ErrorKind::Cancelled,
                other => ErrorKind::Provisioning(other.failure_code()),
            },
            MeshError::Wire(e) => wire_kind(e),
            MeshError::Crypto(e) => crypto_kind(e),
            MeshError::Storage(_) => ErrorKind::Storage,
            MeshError::Busy => ErrorKind::Busy,
            MeshError::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    /// Whether the session keeps running normally after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::ConfirmationFailed | ErrorKind::Provisioning(_) | ErrorKind::SessionClosed
        )
    }
}

fn transport_kind(e: &TransportError) -> ErrorKind {
    match e {
        TransportError::Malformed(w) => wire_kind(w),
        TransportError::InvalidKeyLength(_) => ErrorKind::InvalidKeyLength,
        TransportError::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
        TransportError::DecryptionFailed => ErrorKind::DecryptionFailed,
        TransportError::ReplayDetected { .. } => ErrorKind::ReplayDetected,
        TransportError::SegmentsNotReceivedTimeout { .. } => ErrorKind::SegmentsNotReceivedTimeout,
        TransportError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
        TransportError::Cancelled => ErrorKind::Cancelled,
        TransportError::SequenceExhausted => ErrorKind::SequenceExhausted,
        TransportError::InvalidKeyIndex(_)
        | TransportError::UnknownNetworkKey(_)
        | TransportError::UnknownAppKey(_) => ErrorKind::UnknownKey,
        TransportError::UnknownNode(_) | TransportError::AddressUnavailable(_) => {
            ErrorKind::UnknownNode
        }
        TransportError::IvIndexOutOfRange { .. } => ErrorKind::MalformedPdu,
    }
}

fn wire_kind(e: &WireError) -> ErrorKind {
    match e {
        WireError::Crypto(c) => crypto_kind(c),
        _ => ErrorKind::MalformedPdu,
    }
}

fn crypto_kind(e: &CryptoError) -> ErrorKind {
    match e {
        CryptoError::InvalidKeyLength(_) => ErrorKind::InvalidKeyLength,
        CryptoError::AuthenticationFailed => ErrorKind::DecryptionFailed,
        _ => ErrorKind::MalformedPdu,
    }
}
