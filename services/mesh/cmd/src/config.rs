//! Configuration handling for the mesh provisioner.
//!
//! Values come from a YAML file, then `MESH_*` environment variables, then
//! command line flags (applied in `main`). A missing or unreadable file
//! falls back to defaults.

use anyhow::{bail, Context, Result};
use mesh_provisioning::ProvisioningConfig;
use mesh_session::SessionConfig;
use mesh_storage::{open_store, MeshStore, StorageMode};
use mesh_transport::{ApplicationKey, NetworkContext, NetworkKey, TransportConfig, DEFAULT_TTL};
use mesh_wire::DEFAULT_PROXY_MTU;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Mesh provisioner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Network identity and keys
    pub network: NetworkConfig,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Session timers and framing
    pub session: SessionSettings,
}

/// Network identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network name, also the storage key
    pub name: String,
    /// Provisioner's own unicast address
    pub unicast_address: u16,
    /// Primary network key, hex
    pub net_key: String,
    /// Network key index
    pub net_key_index: u16,
    /// Application key, hex
    pub app_key: String,
    /// Application key index
    pub app_key_index: u16,
    /// Initial IV index for a new network
    pub iv_index: u32,
    /// TTL for messages that do not set one
    pub default_ttl: u8,
}

/// Storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `file`
    pub mode: String,
    /// Directory for the file backend
    pub data_dir: PathBuf,
    /// Fsync every write
    pub sync_writes: bool,
}

/// Session settings; durations use humantime syntax (`10s`, `150ms`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Bearer MTU
    pub mtu: usize,
    /// Wait for an acknowledged request's status
    pub request_timeout: String,
    /// Abandon a stalled provisioning attempt after this long
    pub provisioning_timeout: String,
    /// Discard partial incoming messages after this long
    pub incomplete_timeout: String,
    /// Segment retransmission rounds
    pub segment_retries: u8,
    /// Attention timer sent with the Invite, in seconds
    pub attention_duration: u8,
    /// Static OOB value shared with devices, hex
    pub static_oob: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "home".to_string(),
            unicast_address: 0x0001,
            net_key: "7dd7364cd842ad18c17c2b820c84c3d6".to_string(),
            net_key_index: 0,
            app_key: "63964771734fbd76e3b40519d1d94a48".to_string(),
            app_key_index: 0,
            iv_index: 0,
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            data_dir: PathBuf::from("./meshdata"),
            sync_writes: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_PROXY_MTU,
            request_timeout: "10s".to_string(),
            provisioning_timeout: "60s".to_string(),
            incomplete_timeout: "10s".to_string(),
            segment_retries: 2,
            attention_duration: 5,
            static_oob: None,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            session: SessionSettings::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<MeshConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        info!(
            "Final mesh configuration: network={}, address={:#06x}, storage={}",
            config.network.name, config.network.unicast_address, config.storage.mode
        );
        Ok(config)
    }

    /// Apply `MESH_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("MESH_NETWORK_NAME") {
            info!("Network name overridden by environment: {}", name);
            self.network.name = name;
        }
        if let Some(address) = lookup("MESH_UNICAST_ADDRESS") {
            match parse_address(&address) {
                Ok(address) => {
                    self.network.unicast_address = address;
                    info!("Unicast address overridden by environment: {:#06x}", address);
                }
                Err(e) => warn!("Ignoring MESH_UNICAST_ADDRESS: {}", e),
            }
        }
        if let Some(key) = lookup("MESH_NET_KEY") {
            self.network.net_key = key;
            info!("Network key overridden by environment");
        }
        if let Some(key) = lookup("MESH_APP_KEY") {
            self.network.app_key = key;
            info!("Application key overridden by environment");
        }
        if let Some(iv_index) = lookup("MESH_IV_INDEX") {
            if let Ok(iv_index) = iv_index.parse::<u32>() {
                self.network.iv_index = iv_index;
                info!("IV index overridden by environment: {}", iv_index);
            }
        }
        if let Some(mode) = lookup("MESH_STORAGE_MODE") {
            info!("Storage mode overridden by environment: {}", mode);
            self.storage.mode = mode;
        }
        if let Some(dir) = lookup("MESH_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
            info!("Data directory overridden by environment: {:?}", self.storage.data_dir);
        }
        if let Some(timeout) = lookup("MESH_REQUEST_TIMEOUT") {
            info!("Request timeout overridden by environment: {}", timeout);
            self.session.request_timeout = timeout;
        }
    }

    /// Session configuration with parsed durations
    pub fn session_config(&self) -> Result<SessionConfig> {
        let s = &self.session;
        let static_oob = s
            .static_oob
            .as_deref()
            .map(mesh_crypto::parse_key_hex)
            .transpose()
            .context("session.static_oob")?;

        Ok(SessionConfig {
            mtu: s.mtu,
            request_timeout: parse_duration("session.request_timeout", &s.request_timeout)?,
            transport: TransportConfig {
                incomplete_timeout: parse_duration("session.incomplete_timeout", &s.incomplete_timeout)?,
                segment_retries: s.segment_retries,
                ..TransportConfig::default()
            },
            provisioning: ProvisioningConfig {
                attention_duration: s.attention_duration,
                static_oob,
                timeout: parse_duration("session.provisioning_timeout", &s.provisioning_timeout)?,
                ..ProvisioningConfig::default()
            },
            ..SessionConfig::default()
        })
    }

    /// A fresh network context from the configured keys
    pub fn network_context(&self) -> Result<NetworkContext> {
        let n = &self.network;
        let net_key = NetworkKey::from_hex(n.net_key_index, &n.net_key).context("network.net_key")?;
        let app_key = ApplicationKey::from_hex(n.app_key_index, n.net_key_index, &n.app_key)
            .context("network.app_key")?;

        let mut context = NetworkContext::new(n.name.clone(), n.unicast_address, net_key);
        context.add_app_key(app_key)?;
        context.iv_index = mesh_transport::IvIndex::new(n.iv_index);
        context.default_ttl = n.default_ttl;
        Ok(context)
    }

    /// Storage backend selected by `storage.mode`
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.storage.mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                data_dir: self.storage.data_dir.clone(),
                sync_writes: self.storage.sync_writes,
            }),
            other => bail!("unknown storage mode {:?} (expected memory or file)", other),
        }
    }

    /// Open the configured store
    pub async fn open_store(&self) -> Result<MeshStore> {
        let store = open_store(self.storage_mode()?).await?;
        Ok(MeshStore::new(store))
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("{}: invalid duration {:?}", field, value))
}

/// Parse `0x0001` or `1`
pub fn parse_address(value: &str) -> Result<u16> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse::<u16>(),
    };
    parsed.with_context(|| format!("invalid address {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.network.name, "home");
        assert_eq!(config.network.unicast_address, 0x0001);
        assert_eq!(config.storage.mode, "memory");

        let session = config.session_config().unwrap();
        assert_eq!(session.request_timeout, Duration::from_secs(10));
        assert_eq!(session.provisioning.timeout, Duration::from_secs(60));
        assert_eq!(session.mtu, DEFAULT_PROXY_MTU);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
network:
  name: office
  unicast_address: 16
  iv_index: 7
storage:
  mode: file
  data_dir: /var/lib/mesh
session:
  request_timeout: 2s 500ms
  static_oob: "00112233445566778899aabbccddeeff"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.network.name, "office");
        assert_eq!(config.network.unicast_address, 0x0010);
        assert_eq!(config.network.net_key, NetworkConfig::default().net_key);
        assert_eq!(config.session.mtu, DEFAULT_PROXY_MTU);

        let session = config.session_config().unwrap();
        assert_eq!(session.request_timeout, Duration::from_millis(2500));
        assert_eq!(session.provisioning.static_oob.unwrap()[0], 0x00);
        assert_eq!(session.provisioning.static_oob.unwrap()[15], 0xFF);

        let context = config.network_context().unwrap();
        assert_eq!(context.name, "office");
        assert_eq!(context.iv_index.transmit_index(), 7);
        assert!(context.app_key(0).is_ok());

        match config.storage_mode().unwrap() {
            StorageMode::File { data_dir, sync_writes } => {
                assert_eq!(data_dir, PathBuf::from("/var/lib/mesh"));
                assert!(sync_writes);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.network, NetworkConfig::default());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"network: [not, a, map]").unwrap();
        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_NETWORK_NAME", "lab"),
            ("MESH_UNICAST_ADDRESS", "0x0042"),
            ("MESH_IV_INDEX", "not-a-number"),
            ("MESH_STORAGE_MODE", "file"),
            ("MESH_REQUEST_TIMEOUT", "3s"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.network.name, "lab");
        assert_eq!(config.network.unicast_address, 0x0042);
        assert_eq!(config.network.iv_index, 0);
        assert_eq!(config.storage.mode, "file");
        assert_eq!(
            config.session_config().unwrap().request_timeout,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let mut config = MeshConfig::default();
        config.session.request_timeout = "soon".to_string();
        assert!(config.session_config().is_err());

        let mut config = MeshConfig::default();
        config.network.net_key = "abcd".to_string();
        assert!(config.network_context().is_err());

        let mut config = MeshConfig::default();
        config.storage.mode = "redis".to_string();
        assert!(config.storage_mode().is_err());

        assert_eq!(parse_address("0x7FFF").unwrap(), 0x7FFF);
        assert_eq!(parse_address("12").unwrap(), 12);
        assert!(parse_address("0xZZ").is_err());
    }
}
