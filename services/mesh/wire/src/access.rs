//! Access PDUs: variable-length opcode followed by parameters.
//!
//! ```text
//! 0xxxxxxx                          1-byte SIG opcode (0x7F reserved)
//! 10xxxxxx xxxxxxxx                 2-byte SIG opcode
//! 11xxxxxx  company-id (LE, 16)     3-byte vendor opcode
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ensure_len;
use crate::WireError;

/// Largest access payload: 32 segments of 12 bytes minus a 32-bit TransMIC
pub const MAX_ACCESS_PAYLOAD: usize = 380;

/// An access-layer opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    /// One-byte SIG opcode (0x00..=0x7E)
    Single(u8),
    /// Two-byte SIG opcode (0x8000..=0xBFFF)
    Double(u16),
    /// Three-byte vendor opcode
    Vendor {
        /// Low 6 bits of the first byte
        opcode: u8,
        /// Bluetooth SIG company identifier
        company_id: u16,
    },
}

impl Opcode {
    /// Build a vendor opcode
    pub const fn vendor(opcode: u8, company_id: u16) -> Self {
        Opcode::Vendor {
            opcode: opcode & 0x3F,
            company_id,
        }
    }

    /// Classify a numeric opcode (`0x00..=0x7E`, `0x8000..=0xBFFF` or
    /// `0xC00000..=0xFFFFFF` with the company ID in host order)
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            0x00..=0x7E => Ok(Opcode::Single(value as u8)),
            0x8000..=0xBFFF => Ok(Opcode::Double(value as u16)),
            0xC0_0000..=0xFF_FFFF => Ok(Opcode::vendor((value >> 16) as u8, value as u16)),
            _ => Err(WireError::Opcode((value >> 16) as u8)),
        }
    }

    /// Numeric form, inverse of [`Opcode::from_u32`]
    pub fn value(&self) -> u32 {
        match *self {
            Opcode::Single(op) => op as u32,
            Opcode::Double(op) => op as u32,
            Opcode::Vendor { opcode, company_id } => {
                0xC0_0000 | ((opcode as u32 & 0x3F) << 16) | company_id as u32
            }
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Opcode::Single(_) => 1,
            Opcode::Double(_) => 2,
            Opcode::Vendor { .. } => 3,
        }
    }

    /// Whether this is a vendor opcode
    pub fn is_vendor(&self) -> bool {
        matches!(self, Opcode::Vendor { .. })
    }

    /// Append the opcode bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Opcode::Single(op) => buf.put_u8(op & 0x7F),
            Opcode::Double(op) => buf.put_u16(0x8000 | (op & 0x3FFF)),
            Opcode::Vendor { opcode, company_id } => {
                buf.put_u8(0xC0 | (opcode & 0x3F));
                buf.put_u16_le(company_id);
            }
        }
    }

    /// Parse the opcode at the start of `bytes`, returning it and its length
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        ensure_len(bytes.len(), 1)?;
        let first = bytes[0];
        match first >> 6 {
            0b00 | 0b01 => {
                if first == 0x7F {
                    return Err(WireError::Opcode(first));
                }
                Ok((Opcode::Single(first), 1))
            }
            0b10 => {
                if bytes.len() < 2 {
                    return Err(WireError::Opcode(first));
                }
                Ok((Opcode::Double(u16::from_be_bytes([first, bytes[1]])), 2))
            }
            _ => {
                if bytes.len() < 3 {
                    return Err(WireError::Opcode(first));
                }
                Ok((
                    Opcode::vendor(first, u16::from_le_bytes([bytes[1], bytes[2]])),
                    3,
                ))
            }
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Single(op) => write!(f, "{:#04x}", op),
            Opcode::Double(op) => write!(f, "{:#06x}", op),
            Opcode::Vendor { opcode, company_id } => {
                write!(f, "{:#04x}:{:#06x}", 0xC0 | opcode, company_id)
            }
        }
    }
}

/// Opcode plus parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    /// Message opcode
    pub opcode: Opcode,
    /// Opcode-specific parameters (little-endian fields)
    pub parameters: Bytes,
}

impl AccessPdu {
    /// Create an access PDU
    pub fn new(opcode: Opcode, parameters: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            parameters: parameters.into(),
        }
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        self.opcode.encoded_len() + self.parameters.len()
    }

    /// Whether the PDU has no parameters
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Serialize the PDU
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.len() > MAX_ACCESS_PAYLOAD {
            return Err(WireError::Size(self.len()));
        }
        let mut buf = BytesMut::with_capacity(self.len());
        self.opcode.encode(&mut buf);
        buf.put_slice(&self.parameters);
        Ok(buf.freeze())
    }

    /// Parse a decrypted access payload
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_ACCESS_PAYLOAD {
            return Err(WireError::Size(bytes.len()));
        }
        let (opcode, used) = Opcode::decode(bytes)?;
        Ok(Self {
            opcode,
            parameters: Bytes::copy_from_slice(&bytes[used..]),
        })
    }
}
