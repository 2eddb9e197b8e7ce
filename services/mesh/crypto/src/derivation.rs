//! Salted key expansion: `s1`, `k1`..`k4` and the material derived from them.

use tracing::trace;

use crate::primitives::aes_cmac;
use crate::{key_from_slice, CryptoError, Key128, KEY_SIZE};

/// Size of the random values exchanged while provisioning
pub const RANDOM_SIZE: usize = 16;

/// Material derived from a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyMaterial {
    /// 7-bit network identifier carried in every network PDU
    pub nid: u8,
    /// Network-layer AES-CCM key
    pub encryption_key: Key128,
    /// Header obfuscation key
    pub privacy_key: Key128,
    /// 64-bit public network identifier used in beacons
    pub network_id: [u8; 8],
    /// Secure network beacon authentication key
    pub beacon_key: Key128,
    /// Node identity key
    pub identity_key: Key128,
}

/// Material derived from an application key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationKeyMaterial {
    /// Upper transport AES-CCM key (the application key itself)
    pub encryption_key: Key128,
    /// 6-bit application key identifier
    pub aid: u8,
}

/// Keys derived at the end of the provisioning random exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key protecting the provisioning data PDU
    pub session_key: Key128,
    /// 13-byte nonce for the provisioning data PDU
    pub session_nonce: [u8; 13],
    /// Per-node device key
    pub device_key: Key128,
}

/// `s1(M) = AES-CMAC_ZERO(M)`
pub fn s1(m: &[u8]) -> Key128 {
    aes_cmac(&[0u8; KEY_SIZE], m)
}

/// `k1(N, SALT, P) = AES-CMAC_T(P)` with `T = AES-CMAC_SALT(N)`
pub fn k1(n: &[u8], salt: &Key128, p: &[u8]) -> Key128 {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// `k2(N, P)`: returns `(NID, EncryptionKey, PrivacyKey)`
pub fn k2(n: &Key128, p: &[u8]) -> (u8, Key128, Key128) {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut input = Vec::with_capacity(KEY_SIZE + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = aes_cmac(&t, &input);

    (t1[15] & 0x7F, t2, t3)
}

/// `k3(N)`: 64-bit network ID
pub fn k3(n: &Key128) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let full = aes_cmac(&t, b"id64\x01");

    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..]);
    out
}

/// `k4(N)`: 6-bit application key identifier
pub fn k4(n: &Key128) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    aes_cmac(&t, b"id6\x01")[15] & 0x3F
}

/// Derive the network-layer material of a 16-byte network key
pub fn derive_network_keys(raw: &[u8]) -> Result<NetworkKeyMaterial, CryptoError> {
    let key = key_from_slice(raw)?;
    let (nid, encryption_key, privacy_key) = k2(&key, &[0x00]);

    let material = NetworkKeyMaterial {
        nid,
        encryption_key,
        privacy_key,
        network_id: k3(&key),
        beacon_key: k1(&key, &s1(b"nkbk"), b"id128\x01"),
        identity_key: k1(&key, &s1(b"nkik"), b"id128\x01"),
    };
    trace!("derived network key material nid={:#04x}", nid);
    Ok(material)
}

/// Derive the upper-transport material of a 16-byte application key
pub fn derive_application_key(raw: &[u8]) -> Result<ApplicationKeyMaterial, CryptoError> {
    let key = key_from_slice(raw)?;
    Ok(ApplicationKeyMaterial {
        encryption_key: key,
        aid: k4(&key),
    })
}

/// `ConfirmationSalt = s1(ConfirmationInputs)`
pub fn confirmation_salt(confirmation_inputs: &[u8]) -> Key128 {
    s1(confirmation_inputs)
}

/// `ConfirmationKey = k1(ECDHSecret, ConfirmationSalt, "prck")`
pub fn confirmation_key(ecdh_secret: &[u8], confirmation_salt: &Key128) -> Key128 {
    k1(ecdh_secret, confirmation_salt, b"prck")
}

/// `Confirmation = AES-CMAC_ConfirmationKey(Random ‖ AuthValue)`
pub fn confirmation(confirmation_key: &Key128, random: &[u8], auth_value: &[u8]) -> Key128 {
    let mut input = Vec::with_capacity(random.len() + auth_value.len());
    input.extend_from_slice(random);
    input.extend_from_slice(auth_value);
    aes_cmac(confirmation_key, &input)
}

/// Derive session key, session nonce and device key from the provisioning salt
pub fn derive_session_keys(
    ecdh_secret: &[u8],
    confirmation_salt: &[u8],
    provisioner_random: &[u8],
    device_random: &[u8],
) -> Result<SessionKeys, CryptoError> {
    if ecdh_secret.len() != crate::SHARED_SECRET_SIZE {
        return Err(CryptoError::InvalidKeyLength(ecdh_secret.len()));
    }
    let salt = key_from_slice(confirmation_salt)?;
    if provisioner_random.len() != RANDOM_SIZE {
        return Err(CryptoError::InvalidKeyLength(provisioner_random.len()));
    }
    if device_random.len() != RANDOM_SIZE {
        return Err(CryptoError::InvalidKeyLength(device_random.len()));
    }

    let mut input = Vec::with_capacity(KEY_SIZE + 2 * RANDOM_SIZE);
    input.extend_from_slice(&salt);
    input.extend_from_slice(provisioner_random);
    input.extend_from_slice(device_random);
    let provisioning_salt = s1(&input);

    let nonce_full = k1(ecdh_secret, &provisioning_salt, b"prsn");
    let mut session_nonce = [0u8; 13];
    session_nonce.copy_from_slice(&nonce_full[3..]);

    Ok(SessionKeys {
        session_key: k1(ecdh_secret, &provisioning_salt, b"prsk"),
        session_nonce,
        device_key: k1(ecdh_secret, &provisioning_salt, b"prdk"),
    })
}

/// `DeviceKey = k1(ECDHSecret, ProvisioningSalt, "prdk")`
pub fn derive_device_key(
    ecdh_secret: &[u8],
    confirmation_salt: &[u8],
    provisioner_random: &[u8],
    device_random: &[u8],
) -> Result<Key128, CryptoError> {
    derive_session_keys(
        ecdh_secret,
        confirmation_salt,
        provisioner_random,
        device_random,
    )
    .map(|keys| keys.device_key)
}

/// Parse a 32-character hex string into a 128-bit key
pub fn parse_key_hex(s: &str) -> Result<Key128, CryptoError> {
    let trimmed = s.trim();
    let bytes = hex::decode(trimmed).map_err(|_| CryptoError::InvalidHex(trimmed.to_string()))?;
    key_from_slice(&bytes)
}
