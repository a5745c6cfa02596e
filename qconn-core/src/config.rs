//! # Connection Configuration
//!
//! Runtime knobs ingested once per connection. Options arrive as 4-character
//! tags negotiated out of band; each tag toggles a single named behavior.
//! Flags that affect wire behavior are sampled at `set_from_config` time and
//! frozen for the life of the connection.

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::types::StatelessResetToken;

// ============================================================================
// Connection Option Tags
// ============================================================================

/// A 4-character connection option tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionOption(pub [u8; 4]);

impl ConnectionOption {
    /// MTU discovery targeting the high target (1450 bytes).
    pub const MTUH: ConnectionOption = ConnectionOption(*b"MTUH");
    /// MTU discovery targeting the low target (1430 bytes).
    pub const MTUL: ConnectionOption = ConnectionOption(*b"MTUL");
    /// MTU discovery with the default (low) target.
    pub const KMTU: ConnectionOption = ConnectionOption(*b"kMTU");
    /// Ack decimation.
    pub const ACKD: ConnectionOption = ConnectionOption(*b"ACKD");
    /// Ack decimation with reordering tolerance.
    pub const AKD2: ConnectionOption = ConnectionOption(*b"AKD2");
    /// Ack decimation with the short (RTT/8) delay.
    pub const AKD3: ConnectionOption = ConnectionOption(*b"AKD3");
    /// Ack decimation with reordering tolerance and the short delay.
    pub const AKD4: ConnectionOption = ConnectionOption(*b"AKD4");
    /// Unlimited decimation: never force an ack on the packet-count
    /// threshold while decimating.
    pub const AKDU: ConnectionOption = ConnectionOption(*b"AKDU");
    /// Disable decimation; ack every other retransmittable packet.
    pub const ACD0: ConnectionOption = ConnectionOption(*b"ACD0");
    /// 1 ms delayed ack after a quiescent period.
    pub const ACKQ: ConnectionOption = ConnectionOption(*b"ACKQ");
    /// Close the connection after five consecutive RTOs.
    pub const RTO5: ConnectionOption = ConnectionOption(*b"5RTO");
    /// Suppress STOP_WAITING frames.
    pub const NSTP: ConnectionOption = ConnectionOption(*b"NSTP");
    /// Include receive timestamps in ack frames.
    pub const STMP: ConnectionOption = ConnectionOption(*b"STMP");
    /// Disable pacing offload (ignore writer release-time support).
    pub const NPCO: ConnectionOption = ConnectionOption(*b"NPCO");
}

impl core::fmt::Display for ConnectionOption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

// ============================================================================
// Connection Config
// ============================================================================

/// Configuration applied once via `Connection::set_from_config`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Negotiated option tags.
    pub connection_options: Vec<ConnectionOption>,

    /// Close after this long without network activity.
    pub idle_network_timeout: Duration,

    /// Close if the handshake has not completed by this long after
    /// connection creation. None disables the handshake deadline.
    pub handshake_timeout: Option<Duration>,

    /// Bound on buffered undecryptable packets awaiting keys.
    pub max_undecryptable_packets: usize,

    /// Close silently (no CONNECTION_CLOSE packet) on idle timeout.
    pub silent_close: bool,

    /// Token to recognize stateless resets from the peer.
    pub stateless_reset_token: Option<StatelessResetToken>,

    /// Negotiated connection ID length in bytes.
    pub bytes_for_connection_id: usize,

    /// Short keep-alive deadline used while expecting a response with
    /// nothing left in flight. None disables it.
    pub retransmittable_on_wire_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_options: Vec::new(),
            idle_network_timeout: Duration::from_secs(30),
            handshake_timeout: None,
            max_undecryptable_packets: 0,
            silent_close: false,
            stateless_reset_token: None,
            bytes_for_connection_id: 8,
            retransmittable_on_wire_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Whether `option` was negotiated.
    pub fn has_option(&self, option: ConnectionOption) -> bool {
        self.connection_options.contains(&option)
    }
}

// ============================================================================
// Feature Gate
// ============================================================================

/// Behavior switches fixed at construction.
///
/// These affect wire behavior and must never change mid-connection, so they
/// are sampled exactly once by the constructor rather than read from mutable
/// global state.
#[derive(Debug, Clone, Copy)]
pub struct FeatureGate {
    /// Track largest-received/largest-acked per packet number space
    /// (Initial/Handshake/Application) instead of one shared space.
    pub multiple_packet_number_spaces: bool,

    /// Fill spare congestion window with probing retransmissions.
    pub link_probing: bool,
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self {
            multiple_packet_number_spaces: false,
            link_probing: false,
        }
    }
}
