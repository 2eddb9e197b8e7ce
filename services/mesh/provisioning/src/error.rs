//! Provisioning error types.

use mesh_crypto::CryptoError;
use mesh_wire::{FailureCode, ProvisioningPduType, WireError};
use thiserror::Error;

use crate::ProvisioningState;

/// Reasons a provisioning attempt ends in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// A PDU failed to parse
    #[error("malformed provisioning pdu: {0}")]
    Malformed(#[from] WireError),

    /// ECDH or AES failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A valid PDU that the current state does not accept
    #[error("unexpected {pdu:?} pdu in state {state}")]
    UnexpectedPdu {
        /// State when the PDU arrived
        state: ProvisioningState,
        /// Type of the offending PDU
        pdu: ProvisioningPduType,
    },

    /// The peer's confirmation did not match its random value
    #[error("confirmation value mismatch")]
    ConfirmationFailed,

    /// The Data PDU did not authenticate
    #[error("provisioning data decryption failed")]
    DecryptionFailed,

    /// The peer sent a Failed PDU
    #[error("peer reported failure: {0}")]
    Remote(FailureCode),

    /// The operation is not valid in the current state
    #[error("invalid operation in state {0}")]
    InvalidState(ProvisioningState),

    /// The entered OOB value does not fit the negotiated action
    #[error("invalid auth value: {0}")]
    InvalidAuthValue(String),

    /// Parameters the device cannot satisfy
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// No unicast range is free for the device's elements
    #[error("cannot assign {0} unicast addresses")]
    CannotAssignAddresses(u8),

    /// No progress within the protocol timeout
    #[error("provisioning timed out")]
    Timeout,

    /// Aborted locally
    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisioningError {
    /// Failure code reported to the peer for this error
    pub fn failure_code(&self) -> FailureCode {
        match self {
            ProvisioningError::Malformed(WireError::Type(_)) => FailureCode::InvalidPdu,
            ProvisioningError::Malformed(_) => FailureCode::InvalidFormat,
            ProvisioningError::Crypto(_) => FailureCode::InvalidFormat,
            ProvisioningError::UnexpectedPdu { .. } => FailureCode::UnexpectedPdu,
            ProvisioningError::ConfirmationFailed => FailureCode::ConfirmationFailed,
            ProvisioningError::DecryptionFailed => FailureCode::DecryptionFailed,
            ProvisioningError::Remote(code) => *code,
            ProvisioningError::Unsupported(_) => FailureCode::InvalidFormat,
            ProvisioningError::CannotAssignAddresses(_) => FailureCode::CannotAssignAddresses,
            ProvisioningError::InvalidState(_)
            | ProvisioningError::InvalidAuthValue(_)
            | ProvisioningError::Timeout
            | ProvisioningError::Cancelled => FailureCode::UnexpectedError,
        }
    }
}
