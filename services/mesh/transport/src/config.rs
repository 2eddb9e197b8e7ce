//! Transport timers and retry limits.

use std::time::Duration;

/// Segmentation and reassembly timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Discard a partial incoming message after this long without progress
    pub incomplete_timeout: Duration,
    /// Delay before acknowledging received segments
    pub ack_delay: Duration,
    /// Segment-ack wait, fixed part
    pub segment_ack_base: Duration,
    /// Segment-ack wait, added per TTL hop
    pub segment_ack_per_hop: Duration,
    /// Retransmission rounds before a segmented send fails
    pub segment_retries: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            incomplete_timeout: Duration::from_secs(10),
            ack_delay: Duration::from_millis(150),
            segment_ack_base: Duration::from_millis(200),
            segment_ack_per_hop: Duration::from_millis(50),
            segment_retries: 2,
        }
    }
}

impl TransportConfig {
    /// Segment acknowledgment timer for a message sent with `ttl`
    pub fn segment_ack_timeout(&self, ttl: u8) -> Duration {
        self.segment_ack_base + self.segment_ack_per_hop * ttl as u32
    }
}
