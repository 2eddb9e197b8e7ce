//! Transport error types.

use mesh_crypto::CryptoError;
use mesh_wire::WireError;
use thiserror::Error;

/// Errors raised by the network context and the transport engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A PDU failed to parse
    #[error("malformed pdu: {0}")]
    Malformed(WireError),

    /// Key material of the wrong size
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// Key index outside 0..=4095
    #[error("invalid key index: {0}")]
    InvalidKeyIndex(u16),

    /// Access payload needs more than 32 segments
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// No key authenticated the PDU
    #[error("decryption failed")]
    DecryptionFailed,

    /// Sequence number not newer than the last accepted one
    #[error("replay detected from {src:#06x} seq {seq}")]
    ReplayDetected {
        /// Source address
        src: u16,
        /// Offending sequence number
        seq: u32,
    },

    /// Incomplete timer expired before all segments arrived
    #[error("segments from {src:#06x} seq_zero {seq_zero} not received in time")]
    SegmentsNotReceivedTimeout {
        /// Sender of the partial message
        src: u16,
        /// SeqZero of the partial message
        seq_zero: u16,
    },

    /// Segment acknowledgment retries exhausted
    #[error("no acknowledgment from {dst:#06x} for seq_zero {seq_zero}")]
    OperationTimedOut {
        /// Destination of the unacknowledged message
        dst: u16,
        /// SeqZero of the unacknowledged message
        seq_zero: u16,
    },

    /// The transaction was cancelled locally or by the peer
    #[error("cancelled")]
    Cancelled,

    /// The 24-bit sequence space is used up
    #[error("sequence number exhausted")]
    SequenceExhausted,

    /// Network key index not present
    #[error("unknown network key {0}")]
    UnknownNetworkKey(u16),

    /// Application key index not present
    #[error("unknown application key {0}")]
    UnknownAppKey(u16),

    /// No provisioned node owns the address
    #[error("unknown node {0:#06x}")]
    UnknownNode(u16),

    /// Unicast range already in use or exhausted
    #[error("cannot assign {0} unicast addresses")]
    AddressUnavailable(u8),

    /// A beacon moved the IV index further than allowed
    #[error("iv index {received} out of range (current {current})")]
    IvIndexOutOfRange {
        /// Local IV index
        current: u32,
        /// IV index from the beacon
        received: u32,
    },
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        match e {
            e if e.is_authentication() => TransportError::DecryptionFailed,
            WireError::Crypto(CryptoError::InvalidKeyLength(n)) => TransportError::InvalidKeyLength(n),
            other => TransportError::Malformed(other),
        }
    }
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKeyLength(n) => TransportError::InvalidKeyLength(n),
            CryptoError::InvalidHex(_) => TransportError::InvalidKeyLength(0),
            _ => TransportError::DecryptionFailed,
        }
    }
}
