//! Access layer error types.

use mesh_wire::{Opcode, WireError};
use thiserror::Error;

/// Errors raised while encoding, decoding or tracking access messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// Opcode or PDU failed to parse
    #[error("malformed access pdu: {0}")]
    Malformed(#[from] WireError),

    /// No decoder registered for the opcode
    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// Parameters of the wrong length for the opcode
    #[error("{opcode}: expected {expected} parameter bytes, got {got}")]
    Length {
        /// Message opcode
        opcode: Opcode,
        /// Accepted length (the shortest when several are valid)
        expected: usize,
        /// Actual parameter length
        got: usize,
    },

    /// Parameter values out of range
    #[error("{opcode}: invalid parameters: {reason}")]
    InvalidParameters {
        /// Message opcode
        opcode: Opcode,
        /// What was wrong
        reason: &'static str,
    },

    /// Key index above 0xFFF
    #[error("invalid key index: {0}")]
    InvalidKeyIndex(u16),

    /// No matching status before the deadline
    #[error("no {opcode} from {dst:#06x} before the deadline")]
    OperationTimedOut {
        /// Request destination
        dst: u16,
        /// Expected status opcode
        opcode: Opcode,
    },

    /// Request dropped before a reply arrived
    #[error("request cancelled")]
    Cancelled,
}
