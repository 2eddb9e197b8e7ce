//! Key agreement and confirmation bookkeeping shared by both roles.

use mesh_crypto::{
    confirmation, confirmation_key, confirmation_salt, derive_session_keys, CryptoError,
    EcdhKeyPair, Key128, SessionKeys, RANDOM_SIZE,
};
use mesh_wire::{PROVISIONING_PUBLIC_KEY_SIZE, PROVISIONING_VALUE_SIZE};
use rand::RngCore;

use crate::{AuthValue, ProvisioningError};

/// Invite (1) + Capabilities (11) + Start (5) + two public keys
const CONFIRMATION_INPUTS_SIZE: usize = 1 + 11 + 5 + 2 * PROVISIONING_PUBLIC_KEY_SIZE;

pub(crate) struct Handshake {
    key_pair: EcdhKeyPair,
    inputs: Vec<u8>,
    secret: Option<[u8; 32]>,
    salt: Key128,
    key: Key128,
    auth: AuthValue,
    random: [u8; RANDOM_SIZE],
    confirmation: Option<[u8; PROVISIONING_VALUE_SIZE]>,
    peer_confirmation: Option<[u8; PROVISIONING_VALUE_SIZE]>,
}

impl Handshake {
    pub(crate) fn new() -> Self {
        let mut random = [0u8; RANDOM_SIZE];
        rand::thread_rng().fill_bytes(&mut random);
        Self {
            key_pair: EcdhKeyPair::generate(),
            inputs: Vec::with_capacity(CONFIRMATION_INPUTS_SIZE),
            secret: None,
            salt: [0u8; 16],
            key: [0u8; 16],
            auth: AuthValue::zero(),
            random,
            confirmation: None,
            peer_confirmation: None,
        }
    }

    /// Append the parameters of an Invite, Capabilities or Start PDU
    pub(crate) fn record(&mut self, value: &[u8]) {
        self.inputs.extend_from_slice(value);
    }

    pub(crate) fn public_key(&self) -> &[u8; PROVISIONING_PUBLIC_KEY_SIZE] {
        self.key_pair.public_key_bytes()
    }

    /// Run ECDH and derive the confirmation key
    ///
    /// Keys are appended provisioner first regardless of which side we are.
    pub(crate) fn agree(
        &mut self,
        provisioner_key: &[u8; PROVISIONING_PUBLIC_KEY_SIZE],
        device_key: &[u8; PROVISIONING_PUBLIC_KEY_SIZE],
    ) -> Result<(), ProvisioningError> {
        if provisioner_key == device_key {
            return Err(CryptoError::InvalidPublicKey.into());
        }
        let peer = if provisioner_key == self.public_key() {
            device_key
        } else {
            provisioner_key
        };
        let secret = self.key_pair.shared_secret(peer)?;

        self.inputs.extend_from_slice(provisioner_key);
        self.inputs.extend_from_slice(device_key);
        self.salt = confirmation_salt(&self.inputs);
        self.key = confirmation_key(&secret, &self.salt);
        self.secret = Some(secret);
        Ok(())
    }

    pub(crate) fn set_auth(&mut self, auth: AuthValue) {
        self.auth = auth;
    }

    pub(crate) fn random(&self) -> &[u8; RANDOM_SIZE] {
        &self.random
    }

    /// Our confirmation value, computed once
    pub(crate) fn confirmation(&mut self) -> [u8; PROVISIONING_VALUE_SIZE] {
        let value = confirmation(&self.key, &self.random, self.auth.as_bytes());
        self.confirmation = Some(value);
        value
    }

    /// Store the peer's confirmation; an echo of ours is rejected
    pub(crate) fn record_peer_confirmation(
        &mut self,
        value: [u8; PROVISIONING_VALUE_SIZE],
    ) -> Result<(), ProvisioningError> {
        if self.confirmation == Some(value) {
            return Err(ProvisioningError::ConfirmationFailed);
        }
        self.peer_confirmation = Some(value);
        Ok(())
    }

    /// Check the peer's random against its earlier confirmation
    pub(crate) fn verify_peer(&self, random: &[u8; RANDOM_SIZE]) -> Result<(), ProvisioningError> {
        let expected = confirmation(&self.key, random, self.auth.as_bytes());
        match self.peer_confirmation {
            Some(value) if value == expected && random != &self.random => Ok(()),
            _ => Err(ProvisioningError::ConfirmationFailed),
        }
    }

    pub(crate) fn session_keys(
        &self,
        provisioner_random: &[u8; RANDOM_SIZE],
        device_random: &[u8; RANDOM_SIZE],
    ) -> Result<SessionKeys, ProvisioningError> {
        let secret = self
            .secret
            .ok_or(ProvisioningError::Crypto(CryptoError::InvalidPublicKey))?;
        Ok(derive_session_keys(
            &secret,
            &self.salt,
            provisioner_random,
            device_random,
        )?)
    }

    #[cfg(test)]
    pub(crate) fn inputs_len(&self) -> usize {
        self.inputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let mut provisioner = Handshake::new();
        let mut device = Handshake::new();
        for side in [&mut provisioner, &mut device] {
            side.record(&[5]);
            side.record(&[0u8; 11]);
            side.record(&[0u8; 5]);
        }
        let prov_key = *provisioner.public_key();
        let dev_key = *device.public_key();
        provisioner.agree(&prov_key, &dev_key).unwrap();
        device.agree(&prov_key, &dev_key).unwrap();
        assert_eq!(provisioner.inputs_len(), CONFIRMATION_INPUTS_SIZE);
        assert_eq!(provisioner.key, device.key);

        let prov_conf = provisioner.confirmation();
        device.record_peer_confirmation(prov_conf).unwrap();
        let dev_conf = device.confirmation();
        provisioner.record_peer_confirmation(dev_conf).unwrap();

        device.verify_peer(provisioner.random()).unwrap();
        provisioner.verify_peer(device.random()).unwrap();

        let a = provisioner
            .session_keys(provisioner.random(), device.random())
            .unwrap();
        let b = device.session_keys(provisioner.random(), device.random()).unwrap();
        assert_eq!(a.device_key, b.device_key);
        assert_eq!(a.session_nonce, b.session_nonce);
    }

    #[test]
    fn test_reflected_confirmation_rejected() {
        let mut side = Handshake::new();
        let conf = side.confirmation();
        assert_eq!(
            side.record_peer_confirmation(conf),
            Err(ProvisioningError::ConfirmationFailed)
        );
    }

    #[test]
    fn test_mismatched_auth_fails() {
        let mut provisioner = Handshake::new();
        let mut device = Handshake::new();
        let prov_key = *provisioner.public_key();
        let dev_key = *device.public_key();
        provisioner.agree(&prov_key, &dev_key).unwrap();
        device.agree(&prov_key, &dev_key).unwrap();
        device.set_auth(AuthValue::numeric(42));

        let dev_conf = device.confirmation();
        provisioner.record_peer_confirmation(dev_conf).unwrap();
        assert_eq!(
            provisioner.verify_peer(device.random()),
            Err(ProvisioningError::ConfirmationFailed)
        );
    }
}
