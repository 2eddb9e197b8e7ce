//! Segmentation and reassembly bookkeeping.

use bytes::{Bytes, BytesMut};
use mesh_wire::{LowerTransportPdu, SegmentInfo, WireError, SEQ_ZERO_MASK};
use std::time::Instant;

use crate::TransportError;

/// Lower transport fields shared by every segment of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Access { akf: bool, aid: u8, szmic: bool },
    Control { opcode: u8 },
}

impl SegmentKind {
    pub(crate) fn is_control(&self) -> bool {
        matches!(self, SegmentKind::Control { .. })
    }

    pub(crate) fn segment_size(&self) -> usize {
        match self {
            SegmentKind::Access { .. } => mesh_wire::ACCESS_SEGMENT_SIZE,
            SegmentKind::Control { .. } => mesh_wire::CONTROL_SEGMENT_SIZE,
        }
    }

    pub(crate) fn pdu(&self, segment: SegmentInfo, payload: Bytes) -> LowerTransportPdu {
        match *self {
            SegmentKind::Access { akf, aid, szmic } => LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                segment,
                payload,
            },
            SegmentKind::Control { opcode } => LowerTransportPdu::SegmentedControl {
                opcode,
                segment,
                payload,
            },
        }
    }

    /// Split a segmented lower PDU into its shared fields, segment info and payload
    pub(crate) fn from_pdu(pdu: LowerTransportPdu) -> Option<(Self, SegmentInfo, Bytes)> {
        match pdu {
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                segment,
                payload,
            } => Some((SegmentKind::Access { akf, aid, szmic }, segment, payload)),
            LowerTransportPdu::SegmentedControl {
                opcode,
                segment,
                payload,
            } => Some((SegmentKind::Control { opcode }, segment, payload)),
            _ => None,
        }
    }
}

/// Bitmap with bits `0..=seg_n` set
pub(crate) fn full_mask(seg_n: u8) -> u32 {
    if seg_n >= 31 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// Recover the first sequence number of a message from one of its segments
pub(crate) fn seq_auth(seq: u32, seq_zero: u16) -> Option<u32> {
    let delta = seq.wrapping_sub(seq_zero as u32) & SEQ_ZERO_MASK as u32;
    seq.checked_sub(delta)
}

/// Partially or fully received segmented message
#[derive(Debug)]
pub(crate) struct IncomingTransaction {
    pub kind: SegmentKind,
    pub seq_auth: u32,
    pub iv_index: u32,
    pub net_key_index: u16,
    pub ttl: u8,
    pub seg_n: u8,
    pub received: u32,
    pub segments: Vec<Option<Bytes>>,
    pub incomplete_deadline: Instant,
    pub ack_deadline: Option<Instant>,
    pub complete: bool,
}

impl IncomingTransaction {
    pub(crate) fn new(
        kind: SegmentKind,
        seq_auth: u32,
        iv_index: u32,
        net_key_index: u16,
        ttl: u8,
        seg_n: u8,
        incomplete_deadline: Instant,
    ) -> Self {
        Self {
            kind,
            seq_auth,
            iv_index,
            net_key_index,
            ttl,
            seg_n,
            received: 0,
            segments: vec![None; seg_n as usize + 1],
            incomplete_deadline,
            ack_deadline: None,
            complete: false,
        }
    }

    /// Whether another segment belongs to this message
    pub(crate) fn matches(&self, kind: SegmentKind, seq_auth: u32, seg_n: u8) -> bool {
        self.kind == kind && self.seq_auth == seq_auth && self.seg_n == seg_n
    }

    /// Store one segment; duplicates overwrite
    pub(crate) fn insert(&mut self, segment: SegmentInfo, payload: Bytes) -> Result<(), TransportError> {
        if segment.seg_n != self.seg_n {
            return Err(TransportError::Malformed(WireError::SegmentIndex {
                seg_o: segment.seg_o,
                seg_n: segment.seg_n,
            }));
        }
        if segment.seg_o < self.seg_n && payload.len() != self.kind.segment_size() {
            return Err(TransportError::Malformed(WireError::Length {
                expected: self.kind.segment_size(),
                got: payload.len(),
            }));
        }
        self.segments[segment.seg_o as usize] = Some(payload);
        self.received |= 1 << segment.seg_o;
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received == full_mask(self.seg_n)
    }

    /// Join the segments in order
    pub(crate) fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.segments.len() * self.kind.segment_size());
        for segment in self.segments.iter().flatten() {
            buf.extend_from_slice(segment);
        }
        buf.freeze()
    }
}

/// Segmented message awaiting acknowledgment
#[derive(Debug)]
pub(crate) struct OutgoingTransaction {
    pub kind: SegmentKind,
    pub src: u16,
    pub ttl: u8,
    pub net_key_index: u16,
    pub seq_zero: u16,
    pub segments: Vec<Bytes>,
    pub acked: u32,
    pub retries_left: u8,
    pub ack_deadline: Instant,
}

impl OutgoingTransaction {
    pub(crate) fn seg_n(&self) -> u8 {
        (self.segments.len() - 1) as u8
    }

    pub(crate) fn is_acked(&self) -> bool {
        self.acked & full_mask(self.seg_n()) == full_mask(self.seg_n())
    }

    /// Indexes not yet acknowledged
    pub(crate) fn missing(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=self.seg_n()).filter(move |i| self.acked & (1 << i) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mask() {
        assert_eq!(full_mask(0), 0b1);
        assert_eq!(full_mask(3), 0b1111);
        assert_eq!(full_mask(31), u32::MAX);
    }

    #[test]
    fn test_seq_auth_recovery() {
        assert_eq!(seq_auth(0x3129AB, 0x09AB), Some(0x3129AB));
        assert_eq!(seq_auth(0x3129AD, 0x09AB), Some(0x3129AB));
        // SeqZero wrapped across the 13-bit boundary
        assert_eq!(seq_auth(0x2001, 0x1FFF), Some(0x1FFF));
        assert_eq!(seq_auth(0x0001, 0x1FFF), None);
    }

    #[test]
    fn test_incoming_reassembly() {
        let kind = SegmentKind::Access {
            akf: true,
            aid: 1,
            szmic: false,
        };
        let mut tx = IncomingTransaction::new(kind, 10, 0, 0, 5, 1, Instant::now());
        let short = SegmentInfo::new(10, 0, 1).unwrap();
        assert!(tx.insert(short, Bytes::from_static(&[1; 5])).is_err());

        tx.insert(SegmentInfo::new(10, 1, 1).unwrap(), Bytes::from_static(&[2; 3]))
            .unwrap();
        assert!(!tx.is_complete());
        tx.insert(short, Bytes::from_static(&[1; 12])).unwrap();
        // Duplicate is harmless
        tx.insert(short, Bytes::from_static(&[1; 12])).unwrap();
        assert!(tx.is_complete());

        let message = tx.assemble();
        assert_eq!(message.len(), 15);
        assert_eq!(&message[12..], &[2, 2, 2]);
    }
}
