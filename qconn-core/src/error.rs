//! Transport error codes for connection closure.
//!
//! Every close funnels through one of these. Recoverable conditions
//! (duplicate acks, old stop-waiting frames, decryption while awaiting keys)
//! are not errors: they are logged, counted, and swallowed.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Transport-level close causes.
///
/// Each variant maps to a wire error code carried in CONNECTION_CLOSE.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error; graceful shutdown.
    #[error("no error")]
    NoError,

    /// Invariant violation inside the connection.
    #[error("internal error")]
    InternalError,

    /// Packet header carried an out-of-bounds packet number.
    #[error("invalid packet header")]
    InvalidPacketHeader,

    /// Ack data too high, too low, or processed reentrantly.
    #[error("invalid ack data")]
    InvalidAckData,

    /// Stop-waiting frame regressed or exceeded its packet number.
    #[error("invalid stop waiting data")]
    InvalidStopWaitingData,

    /// Peer sent an unsupported or flagless version.
    #[error("invalid version")]
    InvalidVersion,

    /// Version negotiation packet listed the version in use.
    #[error("invalid version negotiation packet")]
    InvalidVersionNegotiationPacket,

    /// Stream data arrived unencrypted on a non-crypto stream.
    #[error("unencrypted stream data")]
    UnencryptedStreamData,

    /// Stream body carried an embedded handshake preamble.
    #[error("maybe corrupted memory")]
    MaybeCorruptedMemory,

    /// Sent-packet tracking exceeded its bound.
    #[error("too many outstanding sent packets")]
    TooManyOutstandingSentPackets,

    /// Consecutive retransmission timeouts exceeded the configured limit.
    #[error("too many retransmission timeouts")]
    TooManyRtos,

    /// No network activity within the idle timeout.
    #[error("network idle timeout")]
    NetworkIdleTimeout,

    /// Handshake did not complete within the handshake timeout.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// The writer reported a fatal error.
    #[error("packet write error")]
    PacketWriteError,

    /// Encryption of an outgoing packet failed.
    #[error("encryption failure")]
    EncryptionFailure,

    /// Decryption failed fatally (not an awaiting-keys condition).
    #[error("decryption failure")]
    DecryptionFailure,

    /// Stateless reset received; silent teardown attributed to the peer.
    #[error("public reset")]
    PublicReset,

    /// Self-address changed and the visitor refused the migration.
    #[error("error migrating address")]
    ErrorMigratingAddress,

    /// Peer-supplied close code that has no local variant.
    #[error("peer error: {0:#x}")]
    Peer(u32),
}

impl TransportError {
    /// Convert to the wire error code.
    pub fn to_wire(&self) -> u32 {
        match self {
            TransportError::NoError => 0,
            TransportError::InternalError => 1,
            TransportError::InvalidPacketHeader => 4,
            TransportError::InvalidAckData => 9,
            TransportError::InvalidVersionNegotiationPacket => 10,
            TransportError::DecryptionFailure => 12,
            TransportError::EncryptionFailure => 13,
            TransportError::PublicReset => 19,
            TransportError::InvalidVersion => 20,
            TransportError::NetworkIdleTimeout => 25,
            TransportError::ErrorMigratingAddress => 26,
            TransportError::PacketWriteError => 27,
            TransportError::InvalidStopWaitingData => 60,
            TransportError::UnencryptedStreamData => 61,
            TransportError::HandshakeTimeout => 67,
            TransportError::TooManyOutstandingSentPackets => 68,
            TransportError::TooManyRtos => 85,
            TransportError::MaybeCorruptedMemory => 89,
            TransportError::Peer(code) => *code,
        }
    }

    /// Convert a wire error code to an error.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => TransportError::NoError,
            1 => TransportError::InternalError,
            4 => TransportError::InvalidPacketHeader,
            9 => TransportError::InvalidAckData,
            10 => TransportError::InvalidVersionNegotiationPacket,
            12 => TransportError::DecryptionFailure,
            13 => TransportError::EncryptionFailure,
            19 => TransportError::PublicReset,
            20 => TransportError::InvalidVersion,
            25 => TransportError::NetworkIdleTimeout,
            26 => TransportError::ErrorMigratingAddress,
            27 => TransportError::PacketWriteError,
            60 => TransportError::InvalidStopWaitingData,
            61 => TransportError::UnencryptedStreamData,
            67 => TransportError::HandshakeTimeout,
            68 => TransportError::TooManyOutstandingSentPackets,
            85 => TransportError::TooManyRtos,
            89 => TransportError::MaybeCorruptedMemory,
            other => TransportError::Peer(other),
        }
    }
}
