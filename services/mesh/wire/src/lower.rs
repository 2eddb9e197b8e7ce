//! Lower transport PDUs: segmentation headers and segment acknowledgments.
//!
//! ```text
//! access, unsegmented:   SEG=0 | AKF | AID(6)      UpperPDU (5..=15)
//! access, segmented:     SEG=1 | AKF | AID(6)      SZMIC | SeqZero(13) | SegO(5) | SegN(5)   segment (1..=12)
//! control, unsegmented:  SEG=0 | Opcode(7)         parameters (0..=11)
//! control, segmented:    SEG=1 | Opcode(7)         RFU | SeqZero(13) | SegO(5) | SegN(5)     segment (1..=8)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ensure_len;
use crate::WireError;

/// Segment payload size for access messages
pub const ACCESS_SEGMENT_SIZE: usize = 12;
/// Segment payload size for control messages
pub const CONTROL_SEGMENT_SIZE: usize = 8;
/// Largest upper transport PDU sent unsegmented
pub const MAX_UNSEGMENTED_ACCESS_SIZE: usize = 15;
/// Smallest upper transport access PDU (one opcode byte + TransMIC)
pub const MIN_UPPER_ACCESS_SIZE: usize = 5;
/// Largest unsegmented control parameter block
pub const MAX_UNSEGMENTED_CONTROL_SIZE: usize = 11;
/// Maximum number of segments in one message
pub const MAX_SEGMENTS: usize = 32;
/// Mask for the 13-bit SeqZero
pub const SEQ_ZERO_MASK: u16 = 0x1FFF;
/// Control opcode of the Segment Acknowledgment message
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

/// Segmentation fields shared by segmented access and control PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Low 13 bits of the first segment's sequence number
    pub seq_zero: u16,
    /// Index of this segment
    pub seg_o: u8,
    /// Index of the last segment
    pub seg_n: u8,
}

impl SegmentInfo {
    /// Build segment info, checking the field ranges
    pub fn new(seq_zero: u16, seg_o: u8, seg_n: u8) -> Result<Self, WireError> {
        if seg_n as usize >= MAX_SEGMENTS {
            return Err(WireError::Size(seg_n as usize + 1));
        }
        if seg_o > seg_n {
            return Err(WireError::SegmentIndex { seg_o, seg_n });
        }
        Ok(Self {
            seq_zero: seq_zero & SEQ_ZERO_MASK,
            seg_o,
            seg_n,
        })
    }

    /// Number of segments in the message
    pub fn count(&self) -> usize {
        self.seg_n as usize + 1
    }

    fn pack(&self, top_bit: bool) -> [u8; 3] {
        let v = ((top_bit as u32) << 23)
            | (((self.seq_zero & SEQ_ZERO_MASK) as u32) << 10)
            | (((self.seg_o & 0x1F) as u32) << 5)
            | ((self.seg_n & 0x1F) as u32);
        let b = v.to_be_bytes();
        [b[1], b[2], b[3]]
    }

    fn unpack(bytes: [u8; 3]) -> Result<(bool, Self), WireError> {
        let v = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let top_bit = v & (1 << 23) != 0;
        let seq_zero = ((v >> 10) as u16) & SEQ_ZERO_MASK;
        let seg_o = ((v >> 5) & 0x1F) as u8;
        let seg_n = (v & 0x1F) as u8;
        Ok((top_bit, Self::new(seq_zero, seg_o, seg_n)?))
    }
}

/// A lower transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Whole upper transport access PDU in one network PDU
    UnsegmentedAccess {
        /// Application key flag (0 = device key)
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Encrypted access payload plus 32-bit TransMIC
        upper_pdu: Bytes,
    },
    /// One segment of an upper transport access PDU
    SegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// 64-bit TransMIC flag
        szmic: bool,
        /// Segmentation fields
        segment: SegmentInfo,
        /// Segment payload
        payload: Bytes,
    },
    /// A transport control message
    UnsegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
        /// Control parameters
        parameters: Bytes,
    },
    /// One segment of a transport control message
    SegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
        /// Segmentation fields
        segment: SegmentInfo,
        /// Segment payload
        payload: Bytes,
    },
}

impl LowerTransportPdu {
    /// Whether this PDU carries a segment
    pub fn is_segmented(&self) -> bool {
        matches!(
            self,
            LowerTransportPdu::SegmentedAccess { .. } | LowerTransportPdu::SegmentedControl { .. }
        )
    }

    /// Serialize the PDU
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                check_range(upper_pdu.len(), MIN_UPPER_ACCESS_SIZE, MAX_UNSEGMENTED_ACCESS_SIZE)?;
                buf.put_u8(((*akf as u8) << 6) | (aid & 0x3F));
                buf.put_slice(upper_pdu);
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                segment,
                payload,
            } => {
                check_range(payload.len(), 1, ACCESS_SEGMENT_SIZE)?;
                buf.put_u8(0x80 | ((*akf as u8) << 6) | (aid & 0x3F));
                buf.put_slice(&segment.pack(*szmic));
                buf.put_slice(payload);
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                check_range(parameters.len(), 0, MAX_UNSEGMENTED_CONTROL_SIZE)?;
                buf.put_u8(opcode & 0x7F);
                buf.put_slice(parameters);
            }
            LowerTransportPdu::SegmentedControl {
                opcode,
                segment,
                payload,
            } => {
                check_range(payload.len(), 1, CONTROL_SEGMENT_SIZE)?;
                buf.put_u8(0x80 | (opcode & 0x7F));
                buf.put_slice(&segment.pack(false));
                buf.put_slice(payload);
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a lower transport PDU; `ctl` comes from the network header
    pub fn decode(ctl: bool, bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes.len(), 1)?;
        let first = bytes[0];
        let seg = first & 0x80 != 0;

        match (ctl, seg) {
            (false, false) => {
                let upper = &bytes[1..];
                check_range(upper.len(), MIN_UPPER_ACCESS_SIZE, MAX_UNSEGMENTED_ACCESS_SIZE)?;
                Ok(LowerTransportPdu::UnsegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    upper_pdu: Bytes::copy_from_slice(upper),
                })
            }
            (false, true) => {
                let (szmic, segment, payload) = split_segment(bytes, ACCESS_SEGMENT_SIZE)?;
                Ok(LowerTransportPdu::SegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    szmic,
                    segment,
                    payload,
                })
            }
            (true, false) => {
                let parameters = &bytes[1..];
                check_range(parameters.len(), 0, MAX_UNSEGMENTED_CONTROL_SIZE)?;
                Ok(LowerTransportPdu::UnsegmentedControl {
                    opcode: first & 0x7F,
                    parameters: Bytes::copy_from_slice(parameters),
                })
            }
            (true, true) => {
                let (rfu, segment, payload) = split_segment(bytes, CONTROL_SEGMENT_SIZE)?;
                if rfu {
                    return Err(WireError::Reserved);
                }
                Ok(LowerTransportPdu::SegmentedControl {
                    opcode: first & 0x7F,
                    segment,
                    payload,
                })
            }
        }
    }
}

fn check_range(len: usize, min: usize, max: usize) -> Result<(), WireError> {
    ensure_len(len, min)?;
    if len > max {
        return Err(WireError::Size(len));
    }
    Ok(())
}

fn split_segment(bytes: &[u8], max: usize) -> Result<(bool, SegmentInfo, Bytes), WireError> {
    ensure_len(bytes.len(), 5)?;
    let (top_bit, segment) = SegmentInfo::unpack([bytes[1], bytes[2], bytes[3]])?;
    let payload = &bytes[4..];
    check_range(payload.len(), 1, max)?;
    Ok((top_bit, segment, Bytes::copy_from_slice(payload)))
}

/// Segment Acknowledgment control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAck {
    /// Sent on behalf of a Low Power Node
    pub obo: bool,
    /// SeqZero of the acknowledged message
    pub seq_zero: u16,
    /// Bit `n` set when segment `n` has been received
    pub block_ack: u32,
}

impl SegmentAck {
    /// Parameter block size
    pub const SIZE: usize = 6;

    /// Create an acknowledgment
    pub fn new(seq_zero: u16, block_ack: u32) -> Self {
        Self {
            obo: false,
            seq_zero: seq_zero & SEQ_ZERO_MASK,
            block_ack,
        }
    }

    /// Whether segment `index` is acknowledged
    pub fn is_acked(&self, index: u8) -> bool {
        index < 32 && self.block_ack & (1 << index) != 0
    }

    /// Encode the 6-byte parameter block
    pub fn encode_parameters(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16(((self.obo as u16) << 15) | ((self.seq_zero & SEQ_ZERO_MASK) << 2));
        buf.put_u32(self.block_ack);
        buf.freeze()
    }

    /// Decode the 6-byte parameter block
    pub fn decode_parameters(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::Length {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let mut buf = bytes;
        let head = buf.get_u16();
        if head & 0x0003 != 0 {
            return Err(WireError::Reserved);
        }
        Ok(Self {
            obo: head & 0x8000 != 0,
            seq_zero: (head >> 2) & SEQ_ZERO_MASK,
            block_ack: buf.get_u32(),
        })
    }

    /// Wrap into an unsegmented control PDU
    pub fn to_pdu(&self) -> LowerTransportPdu {
        LowerTransportPdu::UnsegmentedControl {
            opcode: SEGMENT_ACK_OPCODE,
            parameters: self.encode_parameters(),
        }
    }
}
