use crate::error::{RelayError, Result};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of every pooled packet buffer. Must cover the interface MTU.
    pub mtu: usize,

    /// Maximum number of live NAT sessions (one connected socket each).
    ///
    /// When exceeded, the least recently used session is closed to make room.
    pub max_sessions: usize,

    /// TTL of locally synthesized DNS answers.
    pub dns_ttl_secs: u32,

    /// Maximum number of outbound packets handled per relay loop wakeup before socket readiness
    /// is serviced again.
    pub max_outbound_per_cycle: usize,

    /// UDP destination port treated as DNS.
    pub dns_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 16 * 1024,
            max_sessions: 50,
            dns_ttl_secs: 60,
            max_outbound_per_cycle: 256,
            dns_port: 53,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        // IPv4 header + UDP header is the smallest frame we ever build.
        if self.mtu < 28 {
            return Err(RelayError::Config("mtu must be >= 28"));
        }
        if self.max_sessions == 0 {
            return Err(RelayError::Config("max_sessions must be > 0"));
        }
        if self.max_outbound_per_cycle == 0 {
            return Err(RelayError::Config("max_outbound_per_cycle must be > 0"));
        }
        Ok(())
    }
}
