//! # Core Connection Types (RFC 8999, RFC 9000)
//!
//! Fundamental types used throughout the connection core: endpoint
//! perspective, encryption levels, packet number spaces, connection IDs,
//! and the caller-supplied monotonic time abstraction.

#![forbid(unsafe_code)]

use core::time::Duration;

// ============================================================================
// Perspective (Client vs Server)
// ============================================================================

/// Connection endpoint perspective, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Client endpoint
    Client,
    /// Server endpoint
    Server,
}

impl Perspective {
    /// Check if this perspective is the client
    pub fn is_client(self) -> bool {
        matches!(self, Perspective::Client)
    }

    /// Check if this perspective is the server
    pub fn is_server(self) -> bool {
        matches!(self, Perspective::Server)
    }
}

// ============================================================================
// Encryption Levels (RFC 9001 Section 4)
// ============================================================================

/// Encryption level of a packet.
///
/// Levels are ordered; the connection's default level is monotonic once a
/// higher level is installed. Packets encrypted at `Initial` are rejected
/// after `ForwardSecure` keys are active.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    /// Initial obfuscation keys derived from the connection ID
    #[default]
    Initial = 0,
    /// 0-RTT keys from a previous session
    ZeroRtt = 1,
    /// Handshake keys
    Handshake = 2,
    /// 1-RTT forward-secure keys
    ForwardSecure = 3,
}

impl EncryptionLevel {
    /// Packet number space carrying packets of this level.
    pub fn packet_number_space(self) -> PacketNumberSpace {
        match self {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::ForwardSecure => {
                PacketNumberSpace::Application
            }
        }
    }
}

impl core::fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            EncryptionLevel::Initial => "initial",
            EncryptionLevel::ZeroRtt => "0-rtt",
            EncryptionLevel::Handshake => "handshake",
            EncryptionLevel::ForwardSecure => "forward-secure",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Packet Numbers and Spaces (RFC 9000 Section 12.3)
// ============================================================================

/// Packet number, monotonically increasing per packet number space.
///
/// Fields that must distinguish "never assigned" from zero use
/// `Option<PacketNumber>`.
pub type PacketNumber = u64;

/// Maximum packet number value (2^62 - 1)
pub const MAX_PACKET_NUMBER: PacketNumber = (1u64 << 62) - 1;

/// Independent sequence domain for packet numbers.
///
/// When multiple packet number spaces are enabled the connection tracks
/// largest-received/largest-acked per space; otherwise a single space spans
/// all encryption levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketNumberSpace {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

/// Number of distinct packet number spaces.
pub const NUM_PACKET_NUMBER_SPACES: usize = 3;

impl PacketNumberSpace {
    /// All spaces, in level order.
    pub const ALL: [PacketNumberSpace; NUM_PACKET_NUMBER_SPACES] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::Application,
    ];

    /// Index into per-space state arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The lowest encryption level an ack for this space may be sent at.
    pub fn encryption_level(self) -> EncryptionLevel {
        match self {
            PacketNumberSpace::Initial => EncryptionLevel::Initial,
            PacketNumberSpace::Handshake => EncryptionLevel::Handshake,
            PacketNumberSpace::Application => EncryptionLevel::ForwardSecure,
        }
    }
}

// ============================================================================
// Connection ID (RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a connection ID (20 bytes per RFC 9000)
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID - opaque version-independent identifier.
///
/// Stored inline: connection IDs are copied into headers, retry bookkeeping,
/// and log lines far more often than they are created, so the type is a
/// plain `Copy` value with no heap behind it. Unused trailing bytes are
/// always zero, which keeps derived equality and hashing honest.
/// Zero-length connection IDs are permitted.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LENGTH],
}

impl ConnectionId {
    /// Create from a slice, or None when it exceeds [`MAX_CID_LENGTH`].
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        let mut bytes = [0u8; MAX_CID_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Some(Self { len: slice.len() as u8, bytes })
    }

    /// The zero-length connection ID.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

// ============================================================================
// Time Abstraction
// ============================================================================

/// Monotonic timestamp supplied by the injected clock.
///
/// Nanoseconds since an arbitrary epoch; the epoch is meaningless across
/// connections, only differences matter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    /// The zero instant, used as "unset" sentinel by stats only.
    pub const ZERO: Instant = Instant { nanos: 0 };

    /// Create an Instant from nanoseconds since the clock epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create an Instant from microseconds since the clock epoch.
    pub fn from_micros(micros: u64) -> Self {
        Self { nanos: micros.saturating_mul(1_000) }
    }

    /// Nanoseconds since the clock epoch.
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Duration since an earlier instant, zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    /// Duration since another instant, None if `other` is later.
    pub fn checked_duration_since(&self, other: Instant) -> Option<Duration> {
        if self.nanos >= other.nanos {
            Some(Duration::from_nanos(self.nanos - other.nanos))
        } else {
            None
        }
    }

    /// Add a duration, saturating at the representable maximum.
    pub fn saturating_add(&self, duration: Duration) -> Instant {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Instant { nanos: self.nanos.saturating_add(nanos) }
    }

    /// Subtract a duration, saturating at zero.
    pub fn saturating_sub(&self, duration: Duration) -> Instant {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Instant { nanos: self.nanos.saturating_sub(nanos) }
    }

    /// Absolute difference between two instants.
    pub fn abs_delta(&self, other: Instant) -> Duration {
        if self.nanos >= other.nanos {
            Duration::from_nanos(self.nanos - other.nanos)
        } else {
            Duration::from_nanos(other.nanos - self.nanos)
        }
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        self.saturating_add(rhs)
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Handshake protocol carried by a version.
///
/// Negotiating across handshake protocols mid-connection is unsupported; a
/// version negotiation packet selecting a different protocol closes the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeProtocol {
    /// Legacy crypto handshake
    Quic,
    /// TLS 1.3 handshake (IETF QUIC)
    Tls,
}

/// A transport version paired with its handshake protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub handshake: HandshakeProtocol,
    pub number: u32,
}

impl Version {
    pub const fn new(handshake: HandshakeProtocol, number: u32) -> Self {
        Self { handshake, number }
    }

    /// Whether this version uses IETF invariants (long/short header forms,
    /// transport-level CONNECTION_CLOSE).
    pub fn is_ietf(&self) -> bool {
        matches!(self.handshake, HandshakeProtocol::Tls)
    }
}

// ============================================================================
// Transmission and Close Classification
// ============================================================================

/// Why a packet is being (re)transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// First transmission of fresh data
    NotRetransmission,
    /// Retransmission triggered by loss detection
    LossRetransmission,
    /// Retransmission triggered by a retransmission timeout
    RtoRetransmission,
    /// Retransmission triggered by a tail loss probe
    TlpRetransmission,
    /// Retransmit everything unacked (version negotiation, retry)
    AllUnackedRetransmission,
    /// Retransmission used to probe available bandwidth
    ProbingRetransmission,
}

impl TransmissionType {
    /// Whether this transmission reserializes previously sent frames.
    pub fn is_retransmission(self) -> bool {
        !matches!(self, TransmissionType::NotRetransmission)
    }
}

/// How `close()` should behave on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Tear down without sending anything
    SilentClose,
    /// Send a CONNECTION_CLOSE packet before tearing down
    SendConnectionClosePacket,
}

/// Which endpoint initiated connection closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    /// This endpoint closed the connection
    Local,
    /// The peer closed the connection (or reset it)
    Peer,
}

// ============================================================================
// Misc Wire-Adjacent Types
// ============================================================================

/// Stream ID (RFC 9000 Section 2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Pre-shared token carried in stateless reset packets (RFC 9000 §10.3).
pub type StatelessResetToken = [u8; 16];

/// Opaque 8-byte payload of PATH_CHALLENGE / PATH_RESPONSE frames.
pub type PathChallengePayload = [u8; 8];

/// Default ping period for connection keep-alive.
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on a serialized outgoing packet, used to size the
/// retransmission scratch buffer.
pub const MAX_OUTGOING_PACKET_SIZE: usize = 1452;

// ============================================================================
// Unit Tests
// ============================================================================
