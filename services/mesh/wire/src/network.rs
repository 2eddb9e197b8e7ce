//! Network PDU layout, nonce, obfuscation and encryption.
//!
//! ```text
//! +---------+-----------------------------+------------------------------+--------+
//! | IVI|NID | CTL|TTL  SEQ(24)  SRC(16)    | DST(16)  TransportPDU        | NetMIC |
//! | clear   | obfuscated with PECB        | AES-CCM encrypted            | 4 / 8  |
//! +---------+-----------------------------+------------------------------+--------+
//! ```
//!
//! Multi-byte fields are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use mesh_crypto::{aes_ccm_decrypt, aes_ccm_encrypt, aes_ecb, Key128, MicSize, NetworkKeyMaterial};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ensure_len;
use crate::WireError;

/// Smallest valid network PDU
pub const MIN_NETWORK_PDU_SIZE: usize = 14;
/// Largest network PDU carried by the advertising bearer
pub const MAX_NETWORK_PDU_SIZE: usize = 29;
/// Highest TTL value
pub const MAX_TTL: u8 = 0x7F;
/// Highest 24-bit sequence number
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

const OBFUSCATED_SIZE: usize = 6;
const PRIVACY_RANDOM_SIZE: usize = 7;

/// Cleartext network header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// Control message flag (selects the 64-bit NetMIC)
    pub ctl: bool,
    /// Time to live (0..=127)
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source element address
    pub src: u16,
    /// Destination address
    pub dst: u16,
}

impl NetworkHeader {
    /// Pack `CTL|TTL` into one byte
    pub fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & MAX_TTL)
    }

    /// NetMIC size implied by CTL
    pub fn mic_size(&self) -> MicSize {
        MicSize::from_flag(self.ctl)
    }

    /// The network nonce for this header
    pub fn nonce(&self, iv_index: u32) -> [u8; 13] {
        network_nonce(self.ctl_ttl(), self.seq, self.src, iv_index)
    }

    /// Largest transport PDU that fits behind this header
    pub fn max_transport_pdu(&self) -> usize {
        MAX_NETWORK_PDU_SIZE - 1 - OBFUSCATED_SIZE - 2 - self.mic_size().size()
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<(), WireError> {
        if self.ttl > MAX_TTL {
            return Err(WireError::Ttl(self.ttl));
        }
        if self.seq > MAX_SEQUENCE {
            return Err(WireError::Size(self.seq as usize));
        }
        Ok(())
    }

    fn obfuscated_fields(&self) -> [u8; OBFUSCATED_SIZE] {
        let seq = self.seq.to_be_bytes();
        let src = self.src.to_be_bytes();
        [self.ctl_ttl(), seq[1], seq[2], seq[3], src[0], src[1]]
    }
}

/// Network nonce: `0x00 ‖ CTL|TTL ‖ SEQ ‖ SRC ‖ 0x0000 ‖ IV Index`
pub fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// `PECB = e(PrivacyKey, 0x0000000000 ‖ IV Index ‖ PrivacyRandom)`, first 6 bytes
pub fn pecb(privacy_key: &Key128, iv_index: u32, privacy_random: &[u8]) -> [u8; OBFUSCATED_SIZE] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    let n = privacy_random.len().min(PRIVACY_RANDOM_SIZE);
    block[9..9 + n].copy_from_slice(&privacy_random[..n]);

    let mut out = [0u8; OBFUSCATED_SIZE];
    out.copy_from_slice(&aes_ecb(privacy_key, &block)[..OBFUSCATED_SIZE]);
    out
}

/// XOR the `CTL|TTL ‖ SEQ ‖ SRC` bytes with PECB
pub fn obfuscate(
    privacy_key: &Key128,
    iv_index: u32,
    fields: &[u8; OBFUSCATED_SIZE],
    privacy_random: &[u8],
) -> [u8; OBFUSCATED_SIZE] {
    let mask = pecb(privacy_key, iv_index, privacy_random);
    let mut out = *fields;
    for (b, m) in out.iter_mut().zip(mask) {
        *b ^= m;
    }
    out
}

/// Inverse of [`obfuscate`] (the XOR is symmetric)
pub fn deobfuscate(
    privacy_key: &Key128,
    iv_index: u32,
    obfuscated: &[u8; OBFUSCATED_SIZE],
    privacy_random: &[u8],
) -> [u8; OBFUSCATED_SIZE] {
    obfuscate(privacy_key, iv_index, obfuscated, privacy_random)
}

/// A network PDU as received, before deobfuscation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetworkPdu {
    /// Least significant bit of the IV index used by the sender
    pub ivi: bool,
    /// 7-bit network identifier
    pub nid: u8,
    /// Obfuscated `CTL|TTL ‖ SEQ ‖ SRC`
    pub obfuscated: [u8; OBFUSCATED_SIZE],
    /// Encrypted `DST ‖ TransportPDU` followed by the NetMIC
    pub encrypted: Bytes,
}

impl RawNetworkPdu {
    /// Split raw bearer bytes into their network PDU parts
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes.len(), MIN_NETWORK_PDU_SIZE)?;
        if bytes.len() > MAX_NETWORK_PDU_SIZE {
            return Err(WireError::Size(bytes.len()));
        }

        let mut obfuscated = [0u8; OBFUSCATED_SIZE];
        obfuscated.copy_from_slice(&bytes[1..1 + OBFUSCATED_SIZE]);
        Ok(Self {
            ivi: bytes[0] & 0x80 != 0,
            nid: bytes[0] & 0x7F,
            obfuscated,
            encrypted: Bytes::copy_from_slice(&bytes[1 + OBFUSCATED_SIZE..]),
        })
    }

    /// Serialize back to bearer bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + OBFUSCATED_SIZE + self.encrypted.len());
        buf.put_u8(((self.ivi as u8) << 7) | (self.nid & 0x7F));
        buf.put_slice(&self.obfuscated);
        buf.put_slice(&self.encrypted);
        buf.freeze()
    }

    /// The privacy random: first 7 bytes of the encrypted section
    pub fn privacy_random(&self) -> &[u8] {
        &self.encrypted[..PRIVACY_RANDOM_SIZE]
    }
}

/// Encrypt and obfuscate a transport PDU into network PDU bytes
pub fn encode_network_pdu(
    header: &NetworkHeader,
    transport_pdu: &[u8],
    keys: &NetworkKeyMaterial,
    iv_index: u32,
) -> Result<Bytes, WireError> {
    header.validate()?;
    ensure_len(transport_pdu.len(), 1)?;
    if transport_pdu.len() > header.max_transport_pdu() {
        return Err(WireError::Size(transport_pdu.len()));
    }

    let mut plaintext = Vec::with_capacity(2 + transport_pdu.len());
    plaintext.extend_from_slice(&header.dst.to_be_bytes());
    plaintext.extend_from_slice(transport_pdu);

    let encrypted = aes_ccm_encrypt(
        &keys.encryption_key,
        &header.nonce(iv_index),
        &plaintext,
        &[],
        header.mic_size(),
    )?;
    let obfuscated = obfuscate(
        &keys.privacy_key,
        iv_index,
        &header.obfuscated_fields(),
        &encrypted[..PRIVACY_RANDOM_SIZE],
    );

    trace!(
        "network pdu seq={} src={:#06x} dst={:#06x} ctl={}",
        header.seq,
        header.src,
        header.dst,
        header.ctl
    );

    Ok(RawNetworkPdu {
        ivi: iv_index & 1 == 1,
        nid: keys.nid,
        obfuscated,
        encrypted: Bytes::from(encrypted),
    }
    .encode())
}

/// Deobfuscate and decrypt a network PDU with one candidate key and IV index
///
/// Returns the cleartext header and the transport PDU. A NID or MIC mismatch
/// surfaces as an authentication error so callers can try the next key.
pub fn decode_network_pdu(
    raw: &RawNetworkPdu,
    keys: &NetworkKeyMaterial,
    iv_index: u32,
) -> Result<(NetworkHeader, Bytes), WireError> {
    if raw.nid != keys.nid {
        return Err(mesh_crypto::CryptoError::AuthenticationFailed.into());
    }

    let fields = deobfuscate(&keys.privacy_key, iv_index, &raw.obfuscated, raw.privacy_random());
    let ctl = fields[0] & 0x80 != 0;
    let mut header = NetworkHeader {
        ctl,
        ttl: fields[0] & MAX_TTL,
        seq: u32::from_be_bytes([0, fields[1], fields[2], fields[3]]),
        src: u16::from_be_bytes([fields[4], fields[5]]),
        dst: 0,
    };
    ensure_len(raw.encrypted.len(), 2 + 1 + header.mic_size().size())?;

    let plaintext = aes_ccm_decrypt(
        &keys.encryption_key,
        &header.nonce(iv_index),
        &raw.encrypted,
        &[],
        header.mic_size(),
    )?;
    header.dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);

    Ok((header, Bytes::copy_from_slice(&plaintext[2..])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::derive_network_keys;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const IV_INDEX: u32 = 0x1234_5678;
    const MESSAGE_1: &str = "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df";

    fn keys() -> NetworkKeyMaterial {
        derive_network_keys(&hex::decode(NET_KEY).unwrap()).unwrap()
    }

    fn message_1_header() -> NetworkHeader {
        NetworkHeader {
            ctl: true,
            ttl: 0,
            seq: 1,
            src: 0x1201,
            dst: 0xFFFD,
        }
    }

    #[test]
    fn test_network_nonce_layout() {
        let nonce = network_nonce(0x80, 0x000001, 0x1201, IV_INDEX);
        assert_eq!(hex::encode(nonce), "00800000011201000012345678");
    }

    #[test]
    fn test_encode_sample_message_1() {
        let transport = hex::decode("034b50057e400000010000").unwrap();
        let pdu = encode_network_pdu(&message_1_header(), &transport, &keys(), IV_INDEX).unwrap();
        assert_eq!(hex::encode(&pdu), MESSAGE_1);
    }

    #[test]
    fn test_decode_sample_message_1() {
        let raw = RawNetworkPdu::decode(&hex::decode(MESSAGE_1).unwrap()).unwrap();
        assert!(!raw.ivi);
        assert_eq!(raw.nid, 0x68);

        let (header, transport) = decode_network_pdu(&raw, &keys(), IV_INDEX).unwrap();
        assert_eq!(header, message_1_header());
        assert_eq!(hex::encode(&transport), "034b50057e400000010000");
    }

    #[test]
    fn test_tampered_pdu_fails_authentication() {
        let mut bytes = hex::decode(MESSAGE_1).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let raw = RawNetworkPdu::decode(&bytes).unwrap();
        let err = decode_network_pdu(&raw, &keys(), IV_INDEX).unwrap_err();
        assert!(err.is_authentication());

        // Right bytes, wrong IV index
        let raw = RawNetworkPdu::decode(&hex::decode(MESSAGE_1).unwrap()).unwrap();
        assert!(decode_network_pdu(&raw, &keys(), IV_INDEX + 2).is_err());
    }

    #[test]
    fn test_nid_mismatch_is_authentication_error() {
        let mut raw = RawNetworkPdu::decode(&hex::decode(MESSAGE_1).unwrap()).unwrap();
        raw.nid = 0x01;
        let err = decode_network_pdu(&raw, &keys(), IV_INDEX).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_raw_length_bounds() {
        assert_eq!(
            RawNetworkPdu::decode(&[0u8; 13]),
            Err(WireError::Truncated { need: 14, got: 13 })
        );
        assert_eq!(RawNetworkPdu::decode(&[0u8; 30]), Err(WireError::Size(30)));

        let raw = RawNetworkPdu::decode(&hex::decode(MESSAGE_1).unwrap()).unwrap();
        assert_eq!(hex::encode(raw.encode()), MESSAGE_1);
    }

    #[test]
    fn test_header_validation() {
        let mut header = message_1_header();
        header.ttl = 128;
        assert_eq!(header.validate(), Err(WireError::Ttl(128)));

        let mut header = message_1_header();
        header.seq = MAX_SEQUENCE + 1;
        assert!(header.validate().is_err());

        let header = message_1_header();
        assert_eq!(header.max_transport_pdu(), 12);
        let oversized = [0u8; 13];
        assert_eq!(
            encode_network_pdu(&header, &oversized, &keys(), IV_INDEX),
            Err(WireError::Size(13))
        );
    }

    #[test]
    fn test_obfuscation_is_symmetric() {
        let k = keys();
        let fields = [0x05, 0x00, 0x10, 0x20, 0x12, 0x01];
        let random = [1, 2, 3, 4, 5, 6, 7];
        let obf = obfuscate(&k.privacy_key, IV_INDEX, &fields, &random);
        assert_ne!(obf, fields);
        assert_eq!(deobfuscate(&k.privacy_key, IV_INDEX, &obf, &random), fields);
    }
}
