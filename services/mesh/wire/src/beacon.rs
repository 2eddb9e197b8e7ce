//! Mesh beacons: secure network beacon and unprovisioned device beacon.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_crypto::{aes_cmac, Key128};
use serde::{Deserialize, Serialize};

use crate::error::ensure_len;
use crate::WireError;

/// Beacon type of the unprovisioned device beacon
pub const UNPROVISIONED_BEACON_TYPE: u8 = 0x00;
/// Beacon type of the secure network beacon
pub const SECURE_NETWORK_BEACON_TYPE: u8 = 0x01;
/// Encoded size of a secure network beacon
pub const SECURE_NETWORK_BEACON_SIZE: usize = 22;

bitflags! {
    /// Secure network beacon flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BeaconFlags: u8 {
        /// Key refresh phase 2 in progress
        const KEY_REFRESH = 1 << 0;
        /// IV update in progress
        const IV_UPDATE = 1 << 1;
    }
}

/// Secure network beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureNetworkBeacon {
    /// Key refresh and IV update flags
    pub flags: BeaconFlags,
    /// 64-bit network ID of the sender's network key
    pub network_id: [u8; 8],
    /// Current IV index of the sender
    pub iv_index: u32,
    /// First 8 bytes of `AES-CMAC_BeaconKey(flags ‖ network ID ‖ IV index)`
    pub authentication: [u8; 8],
}

impl SecureNetworkBeacon {
    /// Build a beacon and compute its authentication value
    pub fn authenticated(
        beacon_key: &Key128,
        flags: BeaconFlags,
        network_id: [u8; 8],
        iv_index: u32,
    ) -> Self {
        let mut beacon = Self {
            flags,
            network_id,
            iv_index,
            authentication: [0; 8],
        };
        beacon.authentication = beacon.compute_authentication(beacon_key);
        beacon
    }

    /// Check the authentication value against a beacon key
    pub fn verify(&self, beacon_key: &Key128) -> bool {
        self.compute_authentication(beacon_key) == self.authentication
    }

    fn compute_authentication(&self, beacon_key: &Key128) -> [u8; 8] {
        let mut input = [0u8; 13];
        input[0] = self.flags.bits();
        input[1..9].copy_from_slice(&self.network_id);
        input[9..13].copy_from_slice(&self.iv_index.to_be_bytes());

        let mut out = [0u8; 8];
        out.copy_from_slice(&aes_cmac(beacon_key, &input)[..8]);
        out
    }

    /// Serialize including the beacon type byte
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SECURE_NETWORK_BEACON_SIZE);
        buf.put_u8(SECURE_NETWORK_BEACON_TYPE);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.network_id);
        buf.put_u32(self.iv_index);
        buf.put_slice(&self.authentication);
        buf.freeze()
    }

    fn decode_value(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != SECURE_NETWORK_BEACON_SIZE - 1 {
            return Err(WireError::Length {
                expected: SECURE_NETWORK_BEACON_SIZE - 1,
                got: buf.len(),
            });
        }
        let flags = BeaconFlags::from_bits(buf.get_u8()).ok_or(WireError::Reserved)?;
        let mut network_id = [0u8; 8];
        buf.copy_to_slice(&mut network_id);
        let iv_index = buf.get_u32();
        let mut authentication = [0u8; 8];
        buf.copy_to_slice(&mut authentication);
        Ok(Self {
            flags,
            network_id,
            iv_index,
            authentication,
        })
    }
}

/// Unprovisioned device beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprovisionedDeviceBeacon {
    /// Device UUID
    pub uuid: [u8; 16],
    /// OOB information bit field
    pub oob_information: u16,
    /// Hash of the associated URI, if advertised
    pub uri_hash: Option<[u8; 4]>,
}

impl UnprovisionedDeviceBeacon {
    /// Serialize including the beacon type byte
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(23);
        buf.put_u8(UNPROVISIONED_BEACON_TYPE);
        buf.put_slice(&self.uuid);
        buf.put_u16(self.oob_information);
        if let Some(hash) = self.uri_hash {
            buf.put_slice(&hash);
        }
        buf.freeze()
    }

    fn decode_value(mut buf: &[u8]) -> Result<Self, WireError> {
        match buf.len() {
            18 | 22 => {}
            got => return Err(WireError::Length { expected: 18, got }),
        }
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let oob_information = buf.get_u16();
        let uri_hash = if buf.remaining() == 4 {
            let mut hash = [0u8; 4];
            buf.copy_to_slice(&mut hash);
            Some(hash)
        } else {
            None
        };
        Ok(Self {
            uuid,
            oob_information,
            uri_hash,
        })
    }
}

/// Any mesh beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshBeacon {
    /// Type 0x00
    Unprovisioned(UnprovisionedDeviceBeacon),
    /// Type 0x01
    SecureNetwork(SecureNetworkBeacon),
}

impl MeshBeacon {
    /// Parse a beacon by its type byte
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes.len(), 1)?;
        match bytes[0] {
            UNPROVISIONED_BEACON_TYPE => Ok(MeshBeacon::Unprovisioned(
                UnprovisionedDeviceBeacon::decode_value(&bytes[1..])?,
            )),
            SECURE_NETWORK_BEACON_TYPE => Ok(MeshBeacon::SecureNetwork(
                SecureNetworkBeacon::decode_value(&bytes[1..])?,
            )),
            other => Err(WireError::Type(other)),
        }
    }

    /// Serialize the beacon
    pub fn encode(&self) -> Bytes {
        match self {
            MeshBeacon::Unprovisioned(b) => b.encode(),
            MeshBeacon::SecureNetwork(b) => b.encode(),
        }
    }
}
