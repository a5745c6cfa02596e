//! # Path MTU Discovery
//!
//! Probing schedule for growing the packet size beyond the conservative
//! default. Once a target is set, a probe goes out after every
//! `packets_between_probes` sent packets, the gap doubling each time, until
//! the attempts run out or the writer reports the probe exceeded the path
//! MTU (which disables discovery permanently).

#![forbid(unsafe_code)]

use crate::types::PacketNumber;

/// High MTU discovery target, for paths that usually take 1500-byte frames.
pub const MTU_DISCOVERY_TARGET_HIGH: usize = 1450;

/// Low MTU discovery target.
pub const MTU_DISCOVERY_TARGET_LOW: usize = 1430;

/// Sent packets before the first probe.
pub const PACKETS_BETWEEN_MTU_PROBES_BASE: u64 = 100;

/// Total probes ever sent on one connection.
pub const MTU_DISCOVERY_ATTEMPTS: u32 = 3;

/// MTU probing schedule and state.
#[derive(Debug, Clone)]
pub struct MtuDiscovery {
    target: Option<usize>,
    probe_count: u32,
    packets_between_probes: u64,
    next_probe_at: PacketNumber,
    /// Latched when a probe came back MsgTooBig; no further probes ever.
    disabled: bool,
}

impl Default for MtuDiscovery {
    fn default() -> Self {
        Self {
            target: None,
            probe_count: 0,
            packets_between_probes: PACKETS_BETWEEN_MTU_PROBES_BASE,
            next_probe_at: PACKETS_BETWEEN_MTU_PROBES_BASE,
            disabled: false,
        }
    }
}

impl MtuDiscovery {
    /// Enable discovery toward `target`. Ignored when the current packet
    /// length already covers it.
    pub fn set_target(&mut self, target: usize, current_max_packet_length: usize) {
        if target > current_max_packet_length {
            self.target = Some(target);
        }
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Whether probing is still live.
    pub fn enabled(&self) -> bool {
        self.target.is_some() && !self.disabled && self.probe_count < MTU_DISCOVERY_ATTEMPTS
    }

    /// Whether the MTU alarm should be armed after sending `largest_sent`.
    pub fn should_probe(&self, largest_sent: PacketNumber) -> bool {
        self.enabled() && largest_sent >= self.next_probe_at
    }

    /// The alarm fired: advance the schedule and return the probe size.
    ///
    /// Doubles the inter-probe gap, records the next probe's packet number
    /// relative to `largest_sent`, and counts the attempt.
    pub fn on_probe_due(&mut self, largest_sent: PacketNumber) -> Option<usize> {
        if !self.enabled() {
            return None;
        }
        let target = self.target?;
        self.packets_between_probes *= 2;
        self.next_probe_at = largest_sent + self.packets_between_probes + 1;
        self.probe_count += 1;
        Some(target)
    }

    /// The writer reported MsgTooBig for a probe: never probe again.
    pub fn disable(&mut self) {
        self.disabled = true;
        self.target = None;
    }

    pub fn probe_count(&self) -> u32 {
        self.probe_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_until_target_set() {
        let mtu = MtuDiscovery::default();
        assert!(!mtu.enabled());
        assert!(!mtu.should_probe(10_000));
    }

    #[test]
    fn test_target_must_exceed_current_length() {
        let mut mtu = MtuDiscovery::default();
        mtu.set_target(1400, 1452);
        assert!(!mtu.enabled());
        mtu.set_target(MTU_DISCOVERY_TARGET_HIGH, 1200);
        assert!(mtu.enabled());
    }

    #[test]
    fn test_schedule_doubles_between_probes() {
        let mut mtu = MtuDiscovery::default();
        mtu.set_target(MTU_DISCOVERY_TARGET_HIGH, 1200);

        assert!(!mtu.should_probe(99));
        assert!(mtu.should_probe(100));

        assert_eq!(mtu.on_probe_due(100), Some(MTU_DISCOVERY_TARGET_HIGH));
        assert_eq!(mtu.probe_count(), 1);
        // Gap doubled to 200: next probe at 100 + 200 + 1.
        assert!(!mtu.should_probe(300));
        assert!(mtu.should_probe(301));

        assert_eq!(mtu.on_probe_due(301), Some(MTU_DISCOVERY_TARGET_HIGH));
        assert_eq!(mtu.on_probe_due(1000), Some(MTU_DISCOVERY_TARGET_HIGH));
        // Attempt limit exhausted.
        assert!(!mtu.enabled());
        assert_eq!(mtu.on_probe_due(10_000), None);
    }

    #[test]
    fn test_msg_too_big_disables_permanently() {
        let mut mtu = MtuDiscovery::default();
        mtu.set_target(MTU_DISCOVERY_TARGET_LOW, 1200);
        assert!(mtu.enabled());
        mtu.disable();
        assert!(!mtu.enabled());
        // Re-targeting after MsgTooBig stays off.
        mtu.set_target(MTU_DISCOVERY_TARGET_LOW, 1200);
        assert!(!mtu.enabled());
    }
}
