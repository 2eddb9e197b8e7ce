//! Session configuration.

use mesh_provisioning::ProvisioningConfig;
use mesh_transport::TransportConfig;
use mesh_wire::DEFAULT_PROXY_MTU;
use std::time::Duration;

/// Configuration for a mesh session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bearer MTU used to split outbound proxy PDUs
    pub mtu: usize,
    /// How long an acknowledged request waits for its status
    pub request_timeout: Duration,
    /// Depth of the command queue between handles and the actor
    pub command_queue_depth: usize,
    /// Segmentation and acknowledgment timers
    pub transport: TransportConfig,
    /// Provisioner options
    pub provisioning: ProvisioningConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_PROXY_MTU,
            request_timeout: Duration::from_secs(10),
            command_queue_depth: 64,
            transport: TransportConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}
