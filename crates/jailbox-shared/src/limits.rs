//! Resource limits pushed to the Jail unsolicited at startup (spec.md §2,
//! §5; the "getlimits" step of SPEC_FULL's supplemented startup
//! trampoline).

use serde::{Deserialize, Serialize};

/// Memory and CPU ceilings enforced on the Jail/Broker pair. These are
/// sent down RPCSOCK as a fixed-size binary blob before anything else, and
/// mirrored into the cgroup the Host places the pair into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// RSS ceiling in bytes; 0 means unlimited.
    pub memory_bytes: u64,
    /// CPU time ceiling in milliseconds of wall-clock-equivalent CPU time;
    /// 0 means unlimited.
    pub cpu_time_ms: u64,
    /// Maximum number of virtual file descriptors the Broker's fd table
    /// will hand out (spec.md §3's fixed-capacity descriptor table).
    pub max_fds: u16,
}

impl ResourceLimits {
    pub const WIRE_LEN: usize = 8 + 8 + 2;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..8].copy_from_slice(&self.memory_bytes.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cpu_time_ms.to_le_bytes());
        buf[16..18].copy_from_slice(&self.max_fds.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            memory_bytes: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            cpu_time_ms: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            max_fds: u16::from_le_bytes(buf[16..18].try_into().ok()?),
        })
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_time_ms: 10_000,
            max_fds: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_roundtrip_through_the_wire_blob() {
        let limits = ResourceLimits {
            memory_bytes: 1 << 20,
            cpu_time_ms: 5_000,
            max_fds: 32,
        };
        let encoded = limits.encode();
        let decoded = ResourceLimits::decode(&encoded).unwrap();
        assert_eq!(decoded, limits);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(ResourceLimits::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn default_limits_are_nonzero() {
        let limits = ResourceLimits::default();
        assert!(limits.memory_bytes > 0);
        assert!(limits.max_fds > 0);
    }
}
