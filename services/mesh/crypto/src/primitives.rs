//! AES building blocks: CMAC, single-block ECB and CCM.

use aead::{Aead, KeyInit, Payload};
use aes::cipher::BlockEncrypt;
use aes::Aes128;
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};

use crate::{CryptoError, Key128};

/// Length of every CCM nonce used by the mesh layers
pub const NONCE_SIZE: usize = 13;

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// Size of an AES-CCM message integrity code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC
    Small,
    /// 64-bit MIC
    Big,
}

impl MicSize {
    /// MIC length in bytes
    pub fn size(self) -> usize {
        match self {
            MicSize::Small => 4,
            MicSize::Big => 8,
        }
    }

    /// Pick the MIC size for a flag such as CTL or SZMIC
    pub fn from_flag(big: bool) -> Self {
        if big {
            MicSize::Big
        } else {
            MicSize::Small
        }
    }
}

/// AES-CMAC over `msg` with a 128-bit key (RFC 4493)
pub fn aes_cmac(key: &Key128, msg: &[u8]) -> Key128 {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    mac.update(msg);
    let tag = mac.finalize().into_bytes();

    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// Encrypt one 16-byte block with AES-128 (the `e()` function)
pub fn aes_ecb(key: &Key128, block: &[u8; 16]) -> [u8; 16] {
    let cipher = <Aes128 as KeyInit>::new(key.into());
    let mut buf = aes::Block::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

/// AES-CCM encrypt, returning `ciphertext ‖ MIC`
pub fn aes_ccm_encrypt(
    key: &Key128,
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }

    match mic {
        MicSize::Small => seal::<Ccm32>(key, nonce, plaintext, aad),
        MicSize::Big => seal::<Ccm64>(key, nonce, plaintext, aad),
    }
}

/// AES-CCM decrypt `ciphertext ‖ MIC`, verifying the MIC
pub fn aes_ccm_decrypt(
    key: &Key128,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength(nonce.len()));
    }
    if ciphertext.len() < mic.size() {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }

    match mic {
        MicSize::Small => open::<Ccm32>(key, nonce, ciphertext, aad),
        MicSize::Big => open::<Ccm64>(key, nonce, ciphertext, aad),
    }
}

fn seal<C>(key: &Key128, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .encrypt(aead::Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

fn open<C>(key: &Key128, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt(aead::Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}
