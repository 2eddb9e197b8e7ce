//! Upper transport nonces and access payload encryption.

use bytes::Bytes;
use mesh_crypto::{aes_ccm_decrypt, aes_ccm_encrypt, Key128, MicSize};

use crate::WireError;

/// Nonce type for application-key encryption
pub const APPLICATION_NONCE: u8 = 0x01;
/// Nonce type for device-key encryption
pub const DEVICE_NONCE: u8 = 0x02;

/// Which key family secures an upper transport PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceKind {
    /// AKF = 1
    Application,
    /// AKF = 0
    Device,
}

impl NonceKind {
    /// Pick the nonce family from the AKF bit
    pub fn from_akf(akf: bool) -> Self {
        if akf {
            NonceKind::Application
        } else {
            NonceKind::Device
        }
    }

    fn type_byte(self) -> u8 {
        match self {
            NonceKind::Application => APPLICATION_NONCE,
            NonceKind::Device => DEVICE_NONCE,
        }
    }
}

/// `type ‖ ASZMIC<<7 ‖ SEQ ‖ SRC ‖ DST ‖ IV Index`
pub fn upper_nonce(
    kind: NonceKind,
    aszmic: bool,
    seq: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[0] = kind.type_byte();
    nonce[1] = (aszmic as u8) << 7;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Encrypt an access payload, appending the TransMIC
pub fn seal_access(
    key: &Key128,
    nonce: &[u8; 13],
    access_payload: &[u8],
    mic: MicSize,
) -> Result<Bytes, WireError> {
    Ok(Bytes::from(aes_ccm_encrypt(key, nonce, access_payload, &[], mic)?))
}

/// Decrypt an upper transport PDU, verifying the TransMIC
pub fn open_access(
    key: &Key128,
    nonce: &[u8; 13],
    upper_pdu: &[u8],
    mic: MicSize,
) -> Result<Bytes, WireError> {
    Ok(Bytes::from(aes_ccm_decrypt(key, nonce, upper_pdu, &[], mic)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_application_nonce_and_seal() {
        let nonce = upper_nonce(NonceKind::Application, false, 0x3129AB, 0x0003, 0x1201, 0x1234_5678);
        assert_eq!(hex::encode(nonce), "01003129ab0003120112345678");

        let app_key = key("63964771734fbd76e3b40519d1d94a48");
        let access = hex::decode("04000000010703").unwrap();
        let sealed = seal_access(&app_key, &nonce, &access, MicSize::Small).unwrap();
        assert_eq!(hex::encode(&sealed), "d608adc6dc582882f45ec6");
        assert_eq!(
            open_access(&app_key, &nonce, &sealed, MicSize::Small).unwrap().as_ref(),
            access.as_slice()
        );
    }

    #[test]
    fn test_device_nonce_and_seal() {
        let nonce = upper_nonce(NonceKind::from_akf(false), false, 6, 0x0003, 0x1201, 0x1234_5678);
        assert_eq!(hex::encode(nonce), "02000000060003120112345678");

        let dev_key = key("9d6dd0e96eb25dc19a40ed9914f8f03f");
        let sealed =
            seal_access(&dev_key, &nonce, &hex::decode("800300563412").unwrap(), MicSize::Small)
                .unwrap();
        assert_eq!(hex::encode(&sealed), "a3afb6edc573f640f384");
    }

    #[test]
    fn test_aszmic_and_wrong_key() {
        let nonce = upper_nonce(NonceKind::Application, true, 1, 2, 3, 4);
        assert_eq!(nonce[1], 0x80);

        let sealed = seal_access(&[1; 16], &nonce, b"payload", MicSize::Big).unwrap();
        assert_eq!(sealed.len(), 7 + 8);
        let err = open_access(&[2; 16], &nonce, &sealed, MicSize::Big).unwrap_err();
        assert!(err.is_authentication());
    }
}
