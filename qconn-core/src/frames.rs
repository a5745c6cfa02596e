//! # Frame Types Crossing the Framer Boundary (RFC 9000 Section 19)
//!
//! The connection never parses wire bytes; the injected framer decodes
//! packets and delivers these typed frames through the
//! [`crate::interface::FramerVisitor`] callback surface. In the other
//! direction, control frames are queued toward the packet builder as a
//! [`Frame`].

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

use crate::types::{
    EncryptionLevel, Instant, PacketNumber, PathChallengePayload, StreamId,
};

/// STREAM frame carrying application or crypto-stream data.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

/// CRYPTO frame carrying handshake data at a specific encryption level.
#[derive(Debug, Clone)]
pub struct CryptoFrame {
    pub level: EncryptionLevel,
    pub offset: u64,
    pub data: Bytes,
}

/// An inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    pub start: PacketNumber,
    pub end: PacketNumber,
}

/// Fully assembled ACK frame, produced by the received-packet manager for
/// the builder. Incoming acks never materialize this type; they arrive
/// piecewise through the framer callbacks.
#[derive(Debug, Clone, Default)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,
    pub ack_delay: Duration,
    /// Acknowledged ranges, largest first.
    pub ranges: TinyVec<[AckRange; 8]>,
    /// Optional receive timestamps (packet number, receipt time).
    pub timestamps: Vec<(PacketNumber, Instant)>,
}

/// Legacy STOP_WAITING frame advancing the peer's low-water mark.
#[derive(Debug, Clone, Copy)]
pub struct StopWaitingFrame {
    pub least_unacked: PacketNumber,
}

/// RESET_STREAM frame.
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_offset: u64,
}

/// STOP_SENDING frame.
#[derive(Debug, Clone, Copy)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
}

/// Window update (MAX_DATA / MAX_STREAM_DATA); stream id zero means the
/// connection-level window.
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub byte_offset: u64,
}

/// BLOCKED / DATA_BLOCKED frame.
#[derive(Debug, Clone, Copy)]
pub struct BlockedFrame {
    pub stream_id: StreamId,
}

/// GOAWAY frame (legacy session shutdown notice).
#[derive(Debug, Clone)]
pub struct GoAwayFrame {
    pub error_code: u64,
    pub last_good_stream_id: StreamId,
    pub reason: String,
}

/// MAX_STREAMS frame.
#[derive(Debug, Clone, Copy)]
pub struct MaxStreamsFrame {
    pub stream_count: u64,
    pub unidirectional: bool,
}

/// STREAMS_BLOCKED frame.
#[derive(Debug, Clone, Copy)]
pub struct StreamsBlockedFrame {
    pub stream_count: u64,
    pub unidirectional: bool,
}

/// MESSAGE/DATAGRAM frame payload.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub message_id: u64,
    pub data: Bytes,
}

/// PATH_CHALLENGE frame.
#[derive(Debug, Clone, Copy)]
pub struct PathChallengeFrame {
    pub payload: PathChallengePayload,
}

/// PATH_RESPONSE frame.
#[derive(Debug, Clone, Copy)]
pub struct PathResponseFrame {
    pub payload: PathChallengePayload,
}

/// CONNECTION_CLOSE frame, either direction.
#[derive(Debug, Clone)]
pub struct ConnectionCloseFrame {
    pub error_code: u32,
    pub details: String,
    /// IETF transport-level close (as opposed to application close).
    pub transport_close: bool,
}

/// PING frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingFrame;

/// Frame kind tags used for packet-content classification and dispatch
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Padding,
    Ping,
    Ack,
    Stream,
    Crypto,
    StopWaiting,
    RstStream,
    StopSending,
    WindowUpdate,
    Blocked,
    GoAway,
    MaxStreams,
    StreamsBlocked,
    Message,
    PathChallenge,
    PathResponse,
    ConnectionClose,
}

/// Control frames the connection queues toward the packet builder.
#[derive(Debug, Clone)]
pub enum Frame {
    Padding(usize),
    Ping(PingFrame),
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    RstStream(RstStreamFrame),
    StopSending(StopSendingFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    GoAway(GoAwayFrame),
    MaxStreams(MaxStreamsFrame),
    StreamsBlocked(StreamsBlockedFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ConnectionClose(ConnectionCloseFrame),
}

impl Frame {
    /// Whether a frame of this kind must be retransmitted if lost.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::StopWaiting(_) | Frame::ConnectionClose(_)
        )
    }

    /// Classification tag for packet-content tracking.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Padding(_) => FrameKind::Padding,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::StopWaiting(_) => FrameKind::StopWaiting,
            Frame::RstStream(_) => FrameKind::RstStream,
            Frame::StopSending(_) => FrameKind::StopSending,
            Frame::WindowUpdate(_) => FrameKind::WindowUpdate,
            Frame::Blocked(_) => FrameKind::Blocked,
            Frame::GoAway(_) => FrameKind::GoAway,
            Frame::MaxStreams(_) => FrameKind::MaxStreams,
            Frame::StreamsBlocked(_) => FrameKind::StreamsBlocked,
            Frame::PathChallenge(_) => FrameKind::PathChallenge,
            Frame::PathResponse(_) => FrameKind::PathResponse,
            Frame::ConnectionClose(_) => FrameKind::ConnectionClose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmittable_classification() {
        assert!(!Frame::Padding(3).is_retransmittable());
        assert!(!Frame::Ack(AckFrame::default()).is_retransmittable());
        assert!(!Frame::StopWaiting(StopWaitingFrame { least_unacked: 1 }).is_retransmittable());
        assert!(Frame::Ping(PingFrame).is_retransmittable());
        assert!(Frame::PathChallenge(PathChallengeFrame { payload: [0; 8] }).is_retransmittable());
    }
}
