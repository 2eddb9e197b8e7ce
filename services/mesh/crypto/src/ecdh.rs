//! P-256 elliptic-curve Diffie-Hellman for the provisioning key exchange.
//!
//! Public keys travel on the wire as the raw `X ‖ Y` coordinates (64 bytes,
//! each coordinate big-endian), without the SEC1 `0x04` prefix.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::CryptoError;

/// Length of an uncompressed public key without the SEC1 tag
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Length of the ECDH shared secret (X coordinate)
pub const SHARED_SECRET_SIZE: usize = 32;

/// An ephemeral provisioning key pair
pub struct EcdhKeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EcdhKeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Rebuild a key pair from a 32-byte private scalar
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        // Skip the 0x04 uncompressed-point tag
        public.copy_from_slice(&point.as_bytes()[1..]);
        Self { secret, public }
    }

    /// The public key as `X ‖ Y`
    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret with a peer public key given as `X ‖ Y`
    pub fn shared_secret(&self, peer: &[u8]) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
        if peer.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }

        let mut sec1 = [0u8; PUBLIC_KEY_SIZE + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(peer);
        let peer_key = PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)?;

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer_key.as_affine());
        let mut out = [0u8; SHARED_SECRET_SIZE];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}
