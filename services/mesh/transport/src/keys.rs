//! Network and application keys with their derived material.
//!
//! Only the raw keys are serialized; derived material is recomputed when a
//! snapshot is loaded.

use mesh_crypto::{
    derive_application_key, derive_network_keys, key_from_slice, parse_key_hex,
    ApplicationKeyMaterial, Key128, NetworkKeyMaterial,
};
use mesh_wire::BeaconFlags;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::TransportError;

/// Highest 12-bit key index
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

fn check_index(index: u16) -> Result<(), TransportError> {
    if index > MAX_KEY_INDEX {
        return Err(TransportError::InvalidKeyIndex(index));
    }
    Ok(())
}

/// Key refresh procedure phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// Only one key in use
    #[default]
    Normal,
    /// New key distributed; transmit with the old key
    Distributing,
    /// Transmit with the new key; receive with both
    Switching,
}

/// A network key, optionally mid key-refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NetworkKeyRecord", into = "NetworkKeyRecord")]
pub struct NetworkKey {
    index: u16,
    key: Key128,
    material: NetworkKeyMaterial,
    new: Option<(Key128, NetworkKeyMaterial)>,
    phase: KeyRefreshPhase,
}

impl NetworkKey {
    /// Derive a network key from raw bytes
    pub fn new(index: u16, raw: &[u8]) -> Result<Self, TransportError> {
        check_index(index)?;
        let key = key_from_slice(raw)?;
        Ok(Self {
            index,
            key,
            material: derive_network_keys(&key)?,
            new: None,
            phase: KeyRefreshPhase::Normal,
        })
    }

    /// Parse a hex key
    pub fn from_hex(index: u16, hex_key: &str) -> Result<Self, TransportError> {
        Self::new(index, &parse_key_hex(hex_key)?)
    }

    /// Global key index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Current (old) raw key
    pub fn key(&self) -> &Key128 {
        &self.key
    }

    /// Key refresh phase
    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Material used for transmission in the current phase
    pub fn tx_material(&self) -> &NetworkKeyMaterial {
        match (&self.new, self.phase) {
            (Some((_, new)), KeyRefreshPhase::Switching) => new,
            _ => &self.material,
        }
    }

    /// Raw key used for transmission in the current phase
    pub fn tx_key(&self) -> &Key128 {
        match (&self.new, self.phase) {
            (Some((new, _)), KeyRefreshPhase::Switching) => new,
            _ => &self.key,
        }
    }

    /// Every material accepted on reception (old first)
    pub fn rx_materials(&self) -> impl Iterator<Item = &NetworkKeyMaterial> {
        std::iter::once(&self.material).chain(self.new.as_ref().map(|(_, m)| m))
    }

    /// Whether `material` is the refreshed key
    pub fn is_new_material(&self, material: &NetworkKeyMaterial) -> bool {
        self.new.as_ref().map(|(_, m)| m == material).unwrap_or(false)
    }

    /// Phase 1: distribute a new key
    pub fn start_refresh(&mut self, raw: &[u8]) -> Result<(), TransportError> {
        let key = key_from_slice(raw)?;
        self.new = Some((key, derive_network_keys(&key)?));
        self.phase = KeyRefreshPhase::Distributing;
        info!("net key {} refresh: distributing", self.index);
        Ok(())
    }

    /// Phase 2: start transmitting with the new key
    pub fn switch(&mut self) {
        if self.new.is_some() {
            self.phase = KeyRefreshPhase::Switching;
            info!("net key {} refresh: switching", self.index);
        }
    }

    /// Phase 3: revoke the old key
    pub fn revoke(&mut self) {
        if let Some((key, material)) = self.new.take() {
            self.key = key;
            self.material = material;
            info!("net key {} refresh: old key revoked", self.index);
        }
        self.phase = KeyRefreshPhase::Normal;
    }

    /// Beacon flags implied by the refresh phase
    pub fn beacon_flags(&self) -> BeaconFlags {
        if self.phase == KeyRefreshPhase::Switching {
            BeaconFlags::KEY_REFRESH
        } else {
            BeaconFlags::empty()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NetworkKeyRecord {
    index: u16,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_key: Option<String>,
    #[serde(default)]
    phase: KeyRefreshPhase,
}

impl TryFrom<NetworkKeyRecord> for NetworkKey {
    type Error = TransportError;

    fn try_from(record: NetworkKeyRecord) -> Result<Self, Self::Error> {
        let mut key = NetworkKey::from_hex(record.index, &record.key)?;
        if let Some(new_key) = record.new_key {
            key.start_refresh(&parse_key_hex(&new_key)?)?;
            if record.phase == KeyRefreshPhase::Switching {
                key.switch();
            }
        }
        Ok(key)
    }
}

impl From<NetworkKey> for NetworkKeyRecord {
    fn from(key: NetworkKey) -> Self {
        Self {
            index: key.index,
            key: hex::encode(key.key),
            new_key: key.new.map(|(k, _)| hex::encode(k)),
            phase: key.phase,
        }
    }
}

/// An application key bound to one network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ApplicationKeyRecord", into = "ApplicationKeyRecord")]
pub struct ApplicationKey {
    index: u16,
    bound_net_key: u16,
    material: ApplicationKeyMaterial,
}

impl ApplicationKey {
    /// Derive an application key from raw bytes
    pub fn new(index: u16, bound_net_key: u16, raw: &[u8]) -> Result<Self, TransportError> {
        check_index(index)?;
        check_index(bound_net_key)?;
        Ok(Self {
            index,
            bound_net_key,
            material: derive_application_key(raw)?,
        })
    }

    /// Parse a hex key
    pub fn from_hex(index: u16, bound_net_key: u16, hex_key: &str) -> Result<Self, TransportError> {
        Self::new(index, bound_net_key, &parse_key_hex(hex_key)?)
    }

    /// Global key index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Index of the network key this key is bound to
    pub fn bound_net_key(&self) -> u16 {
        self.bound_net_key
    }

    /// Raw key
    pub fn key(&self) -> &Key128 {
        &self.material.encryption_key
    }

    /// 6-bit application key identifier
    pub fn aid(&self) -> u8 {
        self.material.aid
    }
}

#[derive(Serialize, Deserialize)]
struct ApplicationKeyRecord {
    index: u16,
    bound_net_key: u16,
    key: String,
}

impl TryFrom<ApplicationKeyRecord> for ApplicationKey {
    type Error = TransportError;

    fn try_from(record: ApplicationKeyRecord) -> Result<Self, Self::Error> {
        ApplicationKey::from_hex(record.index, record.bound_net_key, &record.key)
    }
}

impl From<ApplicationKey> for ApplicationKeyRecord {
    fn from(key: ApplicationKey) -> Self {
        Self {
            index: key.index,
            bound_net_key: key.bound_net_key,
            key: hex::encode(key.material.encryption_key),
        }
    }
}

/// Serialize 128-bit keys as hex strings
pub(crate) mod hex_key {
    use mesh_crypto::{parse_key_hex, Key128};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Key128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Key128, D::Error> {
        let s = String::deserialize(d)?;
        parse_key_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize optional 128-bit keys as hex strings
pub(crate) mod hex_key_opt {
    use mesh_crypto::{parse_key_hex, Key128};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<Key128>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => s.serialize_some(&hex::encode(key)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Key128>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| parse_key_hex(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";

    #[test]
    fn test_network_key_material() {
        let key = NetworkKey::from_hex(0, NET_KEY).unwrap();
        assert_eq!(key.tx_material().nid, 0x68);
        assert_eq!(key.rx_materials().count(), 1);
        assert_eq!(key.beacon_flags(), BeaconFlags::empty());
    }

    #[test]
    fn test_invalid_key_and_index() {
        assert_eq!(
            NetworkKey::new(0, &[0u8; 15]),
            Err(TransportError::InvalidKeyLength(15))
        );
        assert_eq!(
            NetworkKey::new(0x1000, &[0u8; 16]),
            Err(TransportError::InvalidKeyIndex(0x1000))
        );
        assert!(ApplicationKey::new(1, 0x2000, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_key_refresh_phases() {
        let mut key = NetworkKey::from_hex(0, NET_KEY).unwrap();
        let old_nid = key.tx_material().nid;

        key.start_refresh(&[0x42; 16]).unwrap();
        assert_eq!(key.phase(), KeyRefreshPhase::Distributing);
        assert_eq!(key.tx_material().nid, old_nid);
        assert_eq!(key.rx_materials().count(), 2);

        key.switch();
        assert_eq!(key.phase(), KeyRefreshPhase::Switching);
        assert_eq!(key.tx_key(), &[0x42; 16]);
        assert!(key.is_new_material(key.tx_material()));
        assert_eq!(key.beacon_flags(), BeaconFlags::KEY_REFRESH);

        key.revoke();
        assert_eq!(key.phase(), KeyRefreshPhase::Normal);
        assert_eq!(key.key(), &[0x42; 16]);
        assert_eq!(key.rx_materials().count(), 1);
    }

    #[test]
    fn test_serde_rederives_material() {
        let mut key = NetworkKey::from_hex(3, NET_KEY).unwrap();
        key.start_refresh(&[0x42; 16]).unwrap();
        key.switch();

        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains(NET_KEY));
        let back: NetworkKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let app = ApplicationKey::from_hex(1, 3, "63964771734fbd76e3b40519d1d94a48").unwrap();
        assert_eq!(app.aid(), 0x26);
        let back: ApplicationKey =
            serde_json::from_str(&serde_json::to_string(&app).unwrap()).unwrap();
        assert_eq!(back, app);

        assert!(serde_json::from_str::<NetworkKey>(r#"{"index":0,"key":"zz"}"#).is_err());
    }
}
