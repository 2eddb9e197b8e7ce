//! Provisioning configuration.

use mesh_crypto::Key128;
use std::time::Duration;

/// Settings for the provisioner role
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Attention timer sent in the Invite, in seconds
    pub attention_duration: u8,
    /// Static OOB value shared with devices that advertise one
    pub static_oob: Option<Key128>,
    /// Accept output OOB (the device shows, the user types)
    pub allow_output_oob: bool,
    /// Accept input OOB (the user types on the device)
    pub allow_input_oob: bool,
    /// Abandon an attempt that makes no progress for this long
    pub timeout: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            attention_duration: 5,
            static_oob: None,
            allow_output_oob: true,
            allow_input_oob: true,
            timeout: Duration::from_secs(60),
        }
    }
}
