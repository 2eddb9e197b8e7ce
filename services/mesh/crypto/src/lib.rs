//! Key derivation and cryptographic primitives for mesh.
//!
//! This crate provides the security toolbox defined by the Bluetooth Mesh
//! Profile: AES-CMAC based salt generation and key expansion (`s1`, `k1`..`k4`),
//! AES-CCM authenticated encryption with 32- or 64-bit MICs, the single-block
//! AES used for header obfuscation, and the P-256 ECDH exchange used while
//! provisioning.
//!
//! ## Derived material
//!
//! ```text
//! NetKey ──k2(N, 0x00)──► NID (7 bit) + EncryptionKey + PrivacyKey
//!        ──k3(N)────────► Network ID (64 bit)
//!        ──k1(N, s1("nkbk"), "id128"‖01)──► BeaconKey
//! AppKey ──k4(A)────────► AID (6 bit)
//! ECDH   ──k1(ECDH, ProvisioningSalt, "prdk")──► DeviceKey
//! ```
//!
//! All functions are pure: identical inputs always produce identical outputs,
//! which is what allows a provisioner to reconnect without re-provisioning.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod derivation;
pub mod ecdh;
pub mod error;
pub mod primitives;

pub use derivation::{
    confirmation, confirmation_key, confirmation_salt, derive_application_key,
    derive_device_key, derive_network_keys, derive_session_keys, k1, k2, k3, k4, parse_key_hex,
    s1, ApplicationKeyMaterial, NetworkKeyMaterial, SessionKeys, RANDOM_SIZE,
};
pub use ecdh::{EcdhKeyPair, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
pub use error::CryptoError;
pub use primitives::{aes_ccm_decrypt, aes_ccm_encrypt, aes_cmac, aes_ecb, MicSize, NONCE_SIZE};

/// Size of every mesh key (network, application, device, session)
pub const KEY_SIZE: usize = 16;

/// A 128-bit mesh key
pub type Key128 = [u8; KEY_SIZE];

/// Copy a slice into a 128-bit key, rejecting any other length
pub fn key_from_slice(bytes: &[u8]) -> Result<Key128, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))
}
