//! Offline decoding of captured network PDUs.

use anyhow::{Context, Result};
use mesh_access::{MeshMessage, MessageCatalog};
use mesh_crypto::{derive_application_key, derive_network_keys, Key128, MicSize};
use mesh_wire::{
    decode_network_pdu, open_access, upper_nonce, LowerTransportPdu, NetworkHeader, NonceKind,
    RawNetworkPdu,
};
use std::fmt;

/// Keys available for decoding
#[derive(Debug, Clone)]
pub struct DecodeKeys {
    /// Network key
    pub net_key: Key128,
    /// Candidate application keys
    pub app_keys: Vec<Key128>,
    /// Device key for configuration messages
    pub device_key: Option<Key128>,
    /// Current IV index; the PDU's IVI bit selects it or the one before
    pub iv_index: u32,
}

/// What could be recovered from one network PDU
#[derive(Debug)]
pub struct DecodedPdu {
    /// IV index the PDU was secured with
    pub iv_index: u32,
    /// Cleartext network header
    pub header: NetworkHeader,
    /// Lower transport layer
    pub lower: LowerTransportPdu,
    /// Access layer result for unsegmented access PDUs
    pub access: Option<AccessContent>,
}

/// Access layer result
#[derive(Debug)]
pub enum AccessContent {
    /// Decrypted and decoded
    Message(MeshMessage),
    /// Decrypted, but the catalogue has no decoder
    Undecoded {
        /// Access payload
        payload: Vec<u8>,
        /// Why it was not decoded
        reason: String,
    },
    /// No supplied key opens the upper transport PDU
    NoKey,
}

/// Decode a network PDU down to the access layer where possible
pub fn decode_pdu(bytes: &[u8], keys: &DecodeKeys, catalog: &MessageCatalog) -> Result<DecodedPdu> {
    let raw = RawNetworkPdu::decode(bytes).context("not a network PDU")?;
    let material = derive_network_keys(&keys.net_key)?;
    let iv_index = if (keys.iv_index & 1 == 1) == raw.ivi {
        keys.iv_index
    } else {
        keys.iv_index.saturating_sub(1)
    };

    let (header, transport) =
        decode_network_pdu(&raw, &material, iv_index).context("network key does not match")?;
    let lower = LowerTransportPdu::decode(header.ctl, &transport)?;

    let access = match &lower {
        LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
            Some(open_unsegmented(&header, iv_index, *akf, *aid, upper_pdu, keys, catalog)?)
        }
        _ => None,
    };

    Ok(DecodedPdu {
        iv_index,
        header,
        lower,
        access,
    })
}

fn open_unsegmented(
    header: &NetworkHeader,
    iv_index: u32,
    akf: bool,
    aid: u8,
    upper_pdu: &[u8],
    keys: &DecodeKeys,
    catalog: &MessageCatalog,
) -> Result<AccessContent> {
    let mut candidates = Vec::new();
    if akf {
        for key in &keys.app_keys {
            if derive_application_key(key)?.aid == aid {
                candidates.push(*key);
            }
        }
    } else {
        candidates.extend(keys.device_key);
    }

    let nonce = upper_nonce(
        NonceKind::from_akf(akf),
        false,
        header.seq,
        header.src,
        header.dst,
        iv_index,
    );
    let Some(payload) = candidates
        .iter()
        .find_map(|key| open_access(key, &nonce, upper_pdu, MicSize::Small).ok())
    else {
        return Ok(AccessContent::NoKey);
    };

    Ok(match catalog.decode_pdu(&payload) {
        Ok(message) => AccessContent::Message(message),
        Err(e) => AccessContent::Undecoded {
            payload: payload.to_vec(),
            reason: e.to_string(),
        },
    })
}

impl fmt::Display for DecodedPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "iv_index  {:#010x}", self.iv_index)?;
        writeln!(
            f,
            "network   ctl={} ttl={} seq={:#08x} src={:#06x} dst={:#06x}",
            h.ctl as u8, h.ttl, h.seq, h.src, h.dst
        )?;
        match &self.lower {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => writeln!(
                f,
                "lower     unsegmented access akf={} aid={:#04x} upper={}",
                *akf as u8,
                aid,
                hex::encode(upper_pdu)
            )?,
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                segment,
                payload,
            } => writeln!(
                f,
                "lower     segmented access akf={} aid={:#04x} szmic={} seq_zero={} seg={}/{} payload={}",
                *akf as u8,
                aid,
                *szmic as u8,
                segment.seq_zero,
                segment.seg_o,
                segment.seg_n,
                hex::encode(payload)
            )?,
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => writeln!(
                f,
                "lower     control opcode={:#04x} parameters={}",
                opcode,
                hex::encode(parameters)
            )?,
            LowerTransportPdu::SegmentedControl {
                opcode,
                segment,
                payload,
            } => writeln!(
                f,
                "lower     segmented control opcode={:#04x} seq_zero={} seg={}/{} payload={}",
                opcode,
                segment.seq_zero,
                segment.seg_o,
                segment.seg_n,
                hex::encode(payload)
            )?,
        }
        match &self.access {
            Some(AccessContent::Message(message)) => {
                writeln!(f, "access    {} ({}) {:?}", message.name(), message.opcode(), message)
            }
            Some(AccessContent::Undecoded { payload, reason }) => {
                writeln!(f, "access    {} ({})", hex::encode(payload), reason)
            }
            Some(AccessContent::NoKey) => writeln!(f, "access    no matching key"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_access::{GenericOnOffSet, VendorMessage};
    use mesh_crypto::parse_key_hex;
    use mesh_transport::{
        AccessKey, ApplicationKey, IvIndex, NetworkContext, NetworkKey, OutgoingAccess,
        TransportEngine, TransportOutput,
    };
    use std::time::Instant;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";
    const MESSAGE_1: &str = "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df";

    fn keys(iv_index: u32) -> DecodeKeys {
        DecodeKeys {
            net_key: parse_key_hex(NET_KEY).unwrap(),
            app_keys: vec![parse_key_hex(APP_KEY).unwrap()],
            device_key: None,
            iv_index,
        }
    }

    fn capture(message: &MeshMessage, iv_index: u32) -> Vec<u8> {
        let mut ctx = NetworkContext::new("lamp", 0x0100, NetworkKey::from_hex(0, NET_KEY).unwrap());
        ctx.add_app_key(ApplicationKey::from_hex(0, 0, APP_KEY).unwrap())
            .unwrap();
        ctx.iv_index = IvIndex::new(iv_index);

        let mut engine = TransportEngine::default();
        let payload = message.encode().unwrap();
        engine
            .send_access(
                &mut ctx,
                Instant::now(),
                OutgoingAccess::new(0x0001, AccessKey::Application(0), payload),
            )
            .unwrap();
        match engine.poll_output() {
            Some(TransportOutput::Transmit(pdu)) => pdu.to_vec(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_sample() {
        let decoded = decode_pdu(
            &hex::decode(MESSAGE_1).unwrap(),
            &keys(0x1234_5678),
            &MessageCatalog::default(),
        )
        .unwrap();
        assert_eq!(decoded.iv_index, 0x1234_5678);
        assert!(decoded.header.ctl);
        assert_eq!(decoded.header.src, 0x1201);
        assert_eq!(decoded.header.dst, 0xFFFD);
        assert!(matches!(
            decoded.lower,
            LowerTransportPdu::UnsegmentedControl { opcode: 0x03, .. }
        ));
        assert!(decoded.access.is_none());
        assert!(decoded.to_string().contains("control opcode=0x03"));
    }

    #[test]
    fn test_ivi_selects_previous_index() {
        // Sent at an even index, decoded by a receiver already one ahead
        let decoded = decode_pdu(
            &hex::decode(MESSAGE_1).unwrap(),
            &keys(0x1234_5679),
            &MessageCatalog::default(),
        )
        .unwrap();
        assert_eq!(decoded.iv_index, 0x1234_5678);
    }

    #[test]
    fn test_decode_access_message() {
        let message = MeshMessage::GenericOnOffSet(GenericOnOffSet {
            on: true,
            tid: 9,
            transition: None,
        });
        let pdu = capture(&message, 3);
        let decoded = decode_pdu(&pdu, &keys(3), &MessageCatalog::default()).unwrap();
        assert_eq!(decoded.header.src, 0x0100);
        match decoded.access {
            Some(AccessContent::Message(decoded)) => assert_eq!(decoded, message),
            other => panic!("unexpected {:?}", other),
        }

        let mut no_app = keys(3);
        no_app.app_keys.clear();
        let decoded = decode_pdu(&pdu, &no_app, &MessageCatalog::default()).unwrap();
        assert!(matches!(decoded.access, Some(AccessContent::NoKey)));
    }

    #[test]
    fn test_unknown_vendor_opcode_is_shown_raw() {
        let message = MeshMessage::Vendor(VendorMessage::new(0x05F1, 0x07, vec![0xAA]));
        let pdu = capture(&message, 0);
        let decoded = decode_pdu(&pdu, &keys(0), &MessageCatalog::default()).unwrap();
        match decoded.access {
            Some(AccessContent::Undecoded { payload, .. }) => assert_eq!(payload, vec![0xC7, 0xF1, 0x05, 0xAA]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_network_key() {
        let mut wrong = keys(0x1234_5678);
        wrong.net_key = [0x42; 16];
        assert!(decode_pdu(&hex::decode(MESSAGE_1).unwrap(), &wrong, &MessageCatalog::default()).is_err());
        assert!(decode_pdu(&[0x00; 4], &keys(0), &MessageCatalog::default()).is_err());
    }
}
