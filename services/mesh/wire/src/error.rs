//! Wire protocol error types.

use mesh_crypto::CryptoError;
use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the PDU class requires
    #[error("truncated pdu: need {need} bytes, got {got}")]
    Truncated {
        /// Minimum length for this PDU class
        need: usize,
        /// Bytes actually available
        got: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Exact length mismatch for a fixed-size PDU
    #[error("length mismatch: expected {expected}, got {got}")]
    Length {
        /// Required length
        expected: usize,
        /// Observed length
        got: usize,
    },

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown PDU or message type
    #[error("unknown type {0:#04x}")]
    Type(u8),

    /// Reserved or truncated opcode
    #[error("invalid opcode {0:#04x}")]
    Opcode(u8),

    /// Segment offset beyond the last segment
    #[error("segment {seg_o} beyond last segment {seg_n}")]
    SegmentIndex {
        /// Offending SegO
        seg_o: u8,
        /// Declared SegN
        seg_n: u8,
    },

    /// Invalid TTL
    #[error("invalid ttl {0}")]
    Ttl(u8),

    /// Proxy SAR fragment out of sequence
    #[error("sar fragment out of sequence")]
    Sar,

    /// Malformed PDU structure
    #[error("malformed pdu")]
    Malformed,

    /// Underlying cryptographic operation failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl WireError {
    /// Whether the error comes from MIC verification rather than layout
    pub fn is_authentication(&self) -> bool {
        matches!(self, WireError::Crypto(CryptoError::AuthenticationFailed))
    }
}

/// Fail with [`WireError::Truncated`] unless `got >= need`
pub(crate) fn ensure_len(got: usize, need: usize) -> Result<(), WireError> {
    if got < need {
        return Err(WireError::Truncated { need, got });
    }
    Ok(())
}
