//! Proxy PDU framing for the GATT bearer.
//!
//! Each bearer write starts with `SAR(2) | Type(6)`. Messages longer than the
//! MTU are split into first / continuation / last fragments of the same type.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ensure_len;
use crate::WireError;

/// Smallest MTU that leaves room for one payload byte
pub const MIN_PROXY_MTU: usize = 2;
/// Default ATT MTU payload (23 - 3)
pub const DEFAULT_PROXY_MTU: usize = 20;

/// Message type carried in a proxy PDU
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyPduType {
    /// Network PDU
    NetworkPdu = 0x00,
    /// Mesh beacon
    MeshBeacon = 0x01,
    /// Proxy configuration message
    ProxyConfiguration = 0x02,
    /// Provisioning PDU
    Provisioning = 0x03,
}

impl TryFrom<u8> for ProxyPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProxyPduType::NetworkPdu),
            0x01 => Ok(ProxyPduType::MeshBeacon),
            0x02 => Ok(ProxyPduType::ProxyConfiguration),
            0x03 => Ok(ProxyPduType::Provisioning),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Segmentation and reassembly field
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sar {
    /// Whole message
    Complete = 0b00,
    /// First fragment
    First = 0b01,
    /// Middle fragment
    Continuation = 0b10,
    /// Last fragment
    Last = 0b11,
}

impl Sar {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Sar::Complete,
            0b01 => Sar::First,
            0b10 => Sar::Continuation,
            _ => Sar::Last,
        }
    }
}

/// Splits messages into MTU-sized proxy PDUs
#[derive(Debug, Clone, Copy)]
pub struct ProxySegmenter {
    mtu: usize,
}

impl ProxySegmenter {
    /// Create a segmenter for a bearer MTU
    pub fn new(mtu: usize) -> Result<Self, WireError> {
        ensure_len(mtu, MIN_PROXY_MTU)?;
        Ok(Self { mtu })
    }

    /// The configured MTU
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Split a message into bearer writes
    pub fn segment(&self, pdu_type: ProxyPduType, payload: &[u8]) -> Vec<Bytes> {
        let chunk_size = self.mtu - 1;
        if payload.len() <= chunk_size {
            return vec![frame(Sar::Complete, pdu_type, payload)];
        }

        let total = payload.len().div_ceil(chunk_size);
        payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, chunk)| {
                let sar = match i {
                    0 => Sar::First,
                    n if n == total - 1 => Sar::Last,
                    _ => Sar::Continuation,
                };
                frame(sar, pdu_type, chunk)
            })
            .collect()
    }
}

impl Default for ProxySegmenter {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_PROXY_MTU,
        }
    }
}

fn frame(sar: Sar, pdu_type: ProxyPduType, chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + chunk.len());
    buf.put_u8(((sar as u8) << 6) | pdu_type as u8);
    buf.put_slice(chunk);
    buf.freeze()
}

/// Joins proxy PDU fragments back into messages
#[derive(Debug, Default)]
pub struct ProxyReassembler {
    pending: Option<(ProxyPduType, BytesMut)>,
}

impl ProxyReassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fragmented message is in progress
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feed one bearer write; returns a message when it is complete
    ///
    /// An out-of-sequence fragment drops the partial message and fails.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<(ProxyPduType, Bytes)>, WireError> {
        ensure_len(bytes.len(), 1)?;
        let sar = Sar::from_bits(bytes[0] >> 6);
        let pdu_type = ProxyPduType::try_from(bytes[0] & 0x3F)?;
        let data = &bytes[1..];

        match (sar, self.pending.take()) {
            (Sar::Complete, None) => Ok(Some((pdu_type, Bytes::copy_from_slice(data)))),
            (Sar::First, None) => {
                self.pending = Some((pdu_type, BytesMut::from(data)));
                Ok(None)
            }
            (Sar::Continuation, Some((ty, mut buf))) if ty == pdu_type => {
                buf.extend_from_slice(data);
                self.pending = Some((ty, buf));
                Ok(None)
            }
            (Sar::Last, Some((ty, mut buf))) if ty == pdu_type => {
                buf.extend_from_slice(data);
                Ok(Some((ty, buf.freeze())))
            }
            (sar, partial) => {
                debug!(
                    "proxy sar {:?} out of sequence, dropping {} buffered bytes",
                    sar,
                    partial.map(|(_, b)| b.len()).unwrap_or(0)
                );
                Err(WireError::Sar)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_fits_in_one_write() {
        let segmenter = ProxySegmenter::new(20).unwrap();
        let writes = segmenter.segment(ProxyPduType::NetworkPdu, &[0xAB; 19]);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0], 0x00);

        let mut reassembler = ProxyReassembler::new();
        let (ty, msg) = reassembler.push(&writes[0]).unwrap().unwrap();
        assert_eq!(ty, ProxyPduType::NetworkPdu);
        assert_eq!(msg.as_ref(), &[0xAB; 19]);
    }

    #[test]
    fn test_segment_and_reassemble() {
        let payload: Vec<u8> = (0..66).collect();
        let segmenter = ProxySegmenter::new(20).unwrap();
        let writes = segmenter.segment(ProxyPduType::Provisioning, &payload);
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0][0], 0x43);
        assert_eq!(writes[1][0], 0x83);
        assert_eq!(writes[3][0], 0xC3);
        assert!(writes.iter().all(|w| w.len() <= 20));

        let mut reassembler = ProxyReassembler::new();
        let mut out = None;
        for w in &writes {
            out = reassembler.push(w).unwrap();
        }
        let (ty, msg) = out.unwrap();
        assert_eq!(ty, ProxyPduType::Provisioning);
        assert_eq!(msg.as_ref(), payload.as_slice());
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn test_out_of_sequence_fragments() {
        let mut reassembler = ProxyReassembler::new();
        assert_eq!(reassembler.push(&[0x83, 1]), Err(WireError::Sar));

        reassembler.push(&[0x43, 1]).unwrap();
        assert!(reassembler.is_pending());
        // New first fragment while one is pending
        assert_eq!(reassembler.push(&[0x43, 2]), Err(WireError::Sar));
        assert!(!reassembler.is_pending());

        // Type change mid-message
        reassembler.push(&[0x43, 1]).unwrap();
        assert_eq!(reassembler.push(&[0xC0, 2]), Err(WireError::Sar));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(ProxySegmenter::new(1).is_err());
        let mut reassembler = ProxyReassembler::new();
        assert_eq!(reassembler.push(&[0x05]), Err(WireError::Type(0x05)));
        assert!(reassembler.push(&[]).is_err());
    }
}
