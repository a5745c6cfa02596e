//! # Injected Collaborators
//!
//! The connection core composes with its environment exclusively through the
//! traits in this module: a datagram writer, a framer (parsing + crypto), a
//! packet builder (frame assembly + encryption), the sent/received packet
//! managers (loss detection, congestion control, ack ranges), the session
//! visitor above, and a monotonic clock. All are object-safe and held boxed
//! or borrowed by the connection.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use core::time::Duration;

use crate::error::TransportError;
use crate::frames::{
    AckFrame, BlockedFrame, ConnectionCloseFrame, CryptoFrame, Frame, GoAwayFrame,
    MaxStreamsFrame, MessageFrame, PathChallengeFrame, PathResponseFrame, RstStreamFrame,
    StopSendingFrame, StopWaitingFrame, StreamFrame, StreamsBlockedFrame, WindowUpdateFrame,
};
use crate::path::AddressChangeType;
use crate::types::{
    CloseSource, ConnectionId, EncryptionLevel, Instant, PacketNumber, PathChallengePayload,
    StatelessResetToken, StreamId, TransmissionType, Version,
};

// ============================================================================
// Clock
// ============================================================================

/// Monotonic time source injected at construction; outlives the connection.
pub trait Clock {
    /// Precise current time.
    fn now(&self) -> Instant;

    /// Cheap, possibly slightly stale time for hot paths.
    fn approximate_now(&self) -> Instant {
        self.now()
    }
}

// ============================================================================
// Packet Writer
// ============================================================================

/// Result of handing a datagram to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Bytes accepted by the socket.
    Ok(usize),
    /// Socket would block; caller must retain the packet.
    Blocked,
    /// Socket would block but the writer buffered the data; treat the packet
    /// as sent for congestion accounting.
    BlockedDataBuffered,
    /// Datagram exceeded the path MTU.
    MsgTooBig,
    /// Fatal socket error.
    Error(i32),
}

impl WriteResult {
    /// Either blocked variant.
    pub fn is_blocked(self) -> bool {
        matches!(self, WriteResult::Blocked | WriteResult::BlockedDataBuffered)
    }
}

/// Per-packet send options handed to the writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerPacketOptions {
    /// Offload pacing: how far into the future the kernel should release
    /// this packet. Zero sends immediately.
    pub release_time_delay: Duration,
}

/// Synchronous datagram sink.
///
/// After returning [`WriteResult::Blocked`], `is_write_blocked` must report
/// true until `set_writable` is called.
pub trait PacketWriter {
    /// Write one datagram toward `peer_addr`.
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        options: &PerPacketOptions,
    ) -> WriteResult;

    /// Whether the writer is currently blocked.
    fn is_write_blocked(&self) -> bool;

    /// Clear the blocked state after the driver observes writability.
    fn set_writable(&mut self);

    /// Batch writers accumulate datagrams until `flush`.
    fn is_batch_mode(&self) -> bool {
        false
    }

    /// Flush a batch writer.
    fn flush(&mut self) -> WriteResult {
        WriteResult::Ok(0)
    }

    /// Largest datagram this writer can pass toward `peer_addr`.
    fn max_packet_size(&self, peer_addr: SocketAddr) -> usize;

    /// Whether the writer honors [`PerPacketOptions::release_time_delay`].
    fn supports_release_time(&self) -> bool {
        false
    }

    /// Source address the next write would use, when the platform exposes it.
    fn next_write_location(&self, _self_addr: SocketAddr, _peer_addr: SocketAddr) -> Option<SocketAddr> {
        None
    }
}

/// Writer with explicit ownership: the connection either owns the writer and
/// drops it at teardown, or borrows one shared by the embedder.
pub enum WriterHandle<'a> {
    Owned(Box<dyn PacketWriter + 'a>),
    Borrowed(&'a mut (dyn PacketWriter + 'a)),
}

impl<'a> WriterHandle<'a> {
    pub fn get(&self) -> &(dyn PacketWriter + 'a) {
        match self {
            WriterHandle::Owned(w) => w.as_ref(),
            WriterHandle::Borrowed(w) => &**w,
        }
    }

    pub fn get_mut(&mut self) -> &mut (dyn PacketWriter + 'a) {
        match self {
            WriterHandle::Owned(w) => w.as_mut(),
            WriterHandle::Borrowed(w) => &mut **w,
        }
    }
}

// ============================================================================
// Framer
// ============================================================================

/// Long header packet types (RFC 9000 Section 17.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// Decoded packet header delivered by the framer.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub destination_connection_id: ConnectionId,
    pub source_connection_id: ConnectionId,
    /// Long-form header (version present on the wire).
    pub long_form: bool,
    /// Version flag observed (always true for long form).
    pub version_flag: bool,
    pub version: Option<Version>,
    pub long_packet_type: Option<LongPacketType>,
    pub packet_number: PacketNumber,
    /// Trailing bytes that may be a stateless reset token.
    pub possible_stateless_reset_token: Option<StatelessResetToken>,
}

/// Why the framer failed to process a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerError {
    /// No usable keys yet; the datagram may decrypt later.
    DecryptionFailure,
    /// Unrecoverable protocol violation.
    Protocol(TransportError, String),
}

/// Wire parsing and packet protection, injected by the embedder.
///
/// `process_packet` authenticates and decrypts one datagram and invokes the
/// typed callbacks on `visitor` in wire order. A callback returning false
/// aborts frame processing. Returns false when the datagram was not fully
/// processed; `last_error` then says why.
pub trait Framer {
    fn process_packet(&mut self, datagram: &Bytes, visitor: &mut dyn FramerVisitor) -> bool;

    fn last_error(&self) -> Option<FramerError>;

    /// Point the framer at the negotiated version (client side after
    /// version negotiation, server side after the first valid packet).
    fn set_version(&mut self, version: Version);

    /// Re-derive initial crypters after a retry replaced the server
    /// connection ID.
    fn reinstall_initial_crypters(&mut self, server_connection_id: &ConnectionId);
}

/// Typed callback surface the framer drives; implemented by the connection.
///
/// Handlers returning `false` abort processing of the current packet.
pub trait FramerVisitor {
    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool;
    fn on_decrypted_packet(&mut self, level: EncryptionLevel);
    fn on_packet_header(&mut self, header: &PacketHeader) -> bool;

    fn on_stream_frame(&mut self, frame: StreamFrame) -> bool;
    fn on_crypto_frame(&mut self, frame: CryptoFrame) -> bool;

    fn on_ack_frame_start(&mut self, largest_acked: PacketNumber, ack_delay: Duration) -> bool;
    fn on_ack_range(&mut self, start: PacketNumber, end: PacketNumber) -> bool;
    fn on_ack_timestamp(&mut self, packet_number: PacketNumber, timestamp: Instant) -> bool;
    fn on_ack_frame_end(&mut self, start: PacketNumber) -> bool;

    fn on_stop_waiting_frame(&mut self, frame: StopWaitingFrame) -> bool;
    fn on_padding_frame(&mut self, num_bytes: usize) -> bool;
    fn on_ping_frame(&mut self) -> bool;

    fn on_rst_stream_frame(&mut self, frame: RstStreamFrame) -> bool;
    fn on_stop_sending_frame(&mut self, frame: StopSendingFrame) -> bool;
    fn on_window_update_frame(&mut self, frame: WindowUpdateFrame) -> bool;
    fn on_blocked_frame(&mut self, frame: BlockedFrame) -> bool;
    fn on_goaway_frame(&mut self, frame: GoAwayFrame) -> bool;
    fn on_max_streams_frame(&mut self, frame: MaxStreamsFrame) -> bool;
    fn on_streams_blocked_frame(&mut self, frame: StreamsBlockedFrame) -> bool;
    fn on_message_frame(&mut self, frame: MessageFrame) -> bool;

    fn on_path_challenge_frame(&mut self, frame: PathChallengeFrame) -> bool;
    fn on_path_response_frame(&mut self, frame: PathResponseFrame) -> bool;

    fn on_connection_close_frame(&mut self, frame: ConnectionCloseFrame) -> bool;

    /// Version negotiation packet (client only).
    fn on_version_negotiation_packet(&mut self, versions: Vec<Version>);

    /// Retry packet (client only).
    fn on_retry_packet(
        &mut self,
        original_connection_id: ConnectionId,
        new_connection_id: ConnectionId,
        retry_token: Bytes,
    );

    /// A packet that was not awaited carried a valid stateless reset token.
    fn on_authenticated_stateless_reset(&mut self, token: StatelessResetToken);

    /// An inner QUIC packet found inside the current UDP datagram.
    fn on_coalesced_packet(&mut self, packet: Bytes);

    /// All frames of the current packet have been delivered.
    fn on_packet_complete(&mut self);
}

// ============================================================================
// Packet Builder
// ============================================================================

/// A serialized-but-unsent packet owning its encrypted bytes.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    pub packet_number: PacketNumber,
    pub level: EncryptionLevel,
    pub encrypted: Bytes,
    pub transmission_type: TransmissionType,
    pub has_retransmittable_data: bool,
    /// Frames that must be retransmitted if this packet is lost.
    pub retransmittable_frames: Vec<Frame>,
    /// Packet number of the original transmission, for retransmissions.
    pub original_packet_number: Option<PacketNumber>,
    /// CONNECTION_CLOSE packets are retained for the time-wait phase.
    pub is_termination_packet: bool,
    /// MTU probes get dedicated MsgTooBig handling.
    pub is_mtu_probe: bool,
}

/// Receives serialized packets as the builder flushes; implemented by the
/// connection.
pub trait PacketSink {
    fn on_serialized_packet(&mut self, packet: SerializedPacket);
}

/// Result of consuming stream data into packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumedData {
    pub bytes_consumed: usize,
    pub fin_consumed: bool,
}

/// Result of queueing a MESSAGE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Success,
    EncryptionNotEstablished,
    UnsupportedVersion,
    TooLarge,
    Blocked,
    InternalError,
}

/// Assembles frames into encrypted datagrams.
///
/// The builder accumulates frames until `flush` (or until a packet fills),
/// then hands each [`SerializedPacket`] to the sink. The connection brackets
/// every egress operation in a flusher scope so that all frames produced as
/// side effects serialize together.
pub trait PacketBuilder {
    fn set_encryption_level(&mut self, level: EncryptionLevel);
    fn encryption_level(&self) -> EncryptionLevel;

    fn has_pending_frames(&self) -> bool;

    /// Queue one control frame. May flush a filled packet into `sink`.
    /// Returns false when the frame could not be queued.
    fn queue_frame(&mut self, frame: Frame, sink: &mut dyn PacketSink) -> bool;

    fn consume_stream_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        offset: u64,
        fin: bool,
        sink: &mut dyn PacketSink,
    ) -> ConsumedData;

    fn consume_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
        offset: u64,
        sink: &mut dyn PacketSink,
    ) -> usize;

    fn add_message(&mut self, message_id: u64, data: &[Bytes], sink: &mut dyn PacketSink)
        -> MessageStatus;

    /// Serialize all pending frames into `sink`.
    fn flush(&mut self, sink: &mut dyn PacketSink);

    /// Drop pending frames without serializing (teardown).
    fn clear_pending(&mut self);

    /// Serialize a connectivity probe: PING + PADDING, or
    /// PATH_CHALLENGE + PADDING when `payload` is set.
    fn build_connectivity_probe(
        &mut self,
        payload: Option<PathChallengePayload>,
        sink: &mut dyn PacketSink,
    ) -> bool;

    /// Serialize a path-probe response carrying `payloads` (server echo).
    fn build_path_response(
        &mut self,
        payloads: &[PathChallengePayload],
        sink: &mut dyn PacketSink,
    ) -> bool;

    /// Serialize an MTU probe padded to `target_size`.
    fn build_mtu_probe(&mut self, target_size: usize, sink: &mut dyn PacketSink) -> bool;

    /// Build a version negotiation packet datagram.
    fn build_version_negotiation(&mut self, ietf: bool, versions: &[Version]) -> Bytes;

    /// Install the retry token for subsequent Initial packets.
    fn set_retry_token(&mut self, token: Bytes);

    fn max_packet_length(&self) -> usize;
    fn set_max_packet_length(&mut self, length: usize);
}

// ============================================================================
// Sent Packet Manager
// ============================================================================

/// Error surfaced by a collaborator, with the close detail to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerError {
    pub error: TransportError,
    pub details: String,
}

/// A previously sent packet that must be reserialized.
#[derive(Debug, Clone)]
pub struct PendingRetransmission {
    pub packet_number: PacketNumber,
    pub transmission_type: TransmissionType,
    pub retransmittable_frames: Vec<Frame>,
}

/// Tracks in-flight packets, runs congestion control and RTT estimation,
/// produces retransmission deadlines, and adjudicates incoming acks.
pub trait SentPacketManager {
    /// Record a sent packet. Returns true when the retransmission alarm
    /// must be re-armed.
    fn on_packet_sent(&mut self, packet: &SerializedPacket, send_time: Instant) -> bool;

    fn on_ack_frame_start(
        &mut self,
        largest_acked: PacketNumber,
        ack_delay: Duration,
        receipt_time: Instant,
    );
    fn on_ack_range(&mut self, start: PacketNumber, end: PacketNumber);
    fn on_ack_timestamp(&mut self, packet_number: PacketNumber, timestamp: Instant);

    /// Finish processing the current ack frame. `Ok(true)` means a new
    /// packet was acknowledged (forward progress).
    fn on_ack_frame_end(&mut self, now: Instant) -> Result<bool, ManagerError>;

    /// Advance loss/RTO state after the retransmission alarm fires.
    fn on_retransmission_timeout(&mut self);

    /// Deadline for the retransmission alarm, if any packets are in flight.
    fn retransmission_time(&self) -> Option<Instant>;

    fn has_pending_retransmissions(&self) -> bool;
    fn next_pending_retransmission(&mut self) -> Option<PendingRetransmission>;

    /// Mark every unacked packet for retransmission (version negotiation,
    /// retry).
    fn retransmit_all_unacked(&mut self);

    /// Drop initial-encryption in-flight packets after the handshake.
    fn neuter_unencrypted_packets(&mut self);

    fn has_in_flight_packets(&self) -> bool;
    fn has_unacked_packets(&self) -> bool;

    fn largest_observed(&self) -> Option<PacketNumber>;
    fn largest_sent_packet(&self) -> Option<PacketNumber>;

    /// Smallest packet number still unacked, for outgoing stop-waiting.
    fn least_unacked(&self) -> PacketNumber;

    /// Pacing delay before the next send; zero means "now".
    fn time_until_send(&self, now: Instant) -> Duration;

    /// Whether congestion control permits sending retransmittable data.
    fn can_send(&self, now: Instant) -> bool;

    /// Delay without forward progress after which the path is degrading.
    fn path_degrading_delay(&self) -> Duration;

    fn smoothed_rtt(&self) -> Duration;

    fn consecutive_rto_count(&self) -> u32;
    fn consecutive_tlp_count(&self) -> u32;

    fn set_handshake_confirmed(&mut self);

    /// Reset transport state for an effective peer migration.
    fn on_connection_migration(&mut self, change: AddressChangeType);

    /// Whether ack reneging (largest acked moving backwards) is tolerated.
    fn tolerate_reneging(&self) -> bool {
        false
    }

    /// Earliest time the next packet should leave the host when pacing
    /// offload is in use.
    fn next_release_time(&self) -> Option<Instant> {
        None
    }
}

// ============================================================================
// Received Packet Manager
// ============================================================================

/// Records received packet numbers and produces ack ranges.
///
/// One manager serves either a single packet number space or all three,
/// reported by `num_spaces`.
pub trait ReceivedPacketManager {
    /// 1 (single space) or 3 (Initial/Handshake/Application).
    fn num_spaces(&self) -> usize;

    fn record_packet_received(
        &mut self,
        space: crate::types::PacketNumberSpace,
        header: &PacketHeader,
        receipt_time: Instant,
    );

    /// Whether this packet number has not been seen and is still wanted.
    fn is_awaiting_packet(&self, space: crate::types::PacketNumberSpace, packet_number: PacketNumber) -> bool;

    /// Whether anything new needs acknowledging since the last ack built.
    fn is_ack_frame_updated(&self, space: crate::types::PacketNumberSpace) -> bool;

    /// Build the current ack frame for `space`.
    fn ack_frame(&mut self, space: crate::types::PacketNumberSpace, now: Instant) -> AckFrame;

    /// Advance the low-water mark from a stop-waiting frame.
    fn dont_wait_for_packets_before(
        &mut self,
        space: crate::types::PacketNumberSpace,
        least_unacked: PacketNumber,
    );

    fn has_missing_packets(&self, space: crate::types::PacketNumberSpace) -> bool;

    /// Whether the most recent receipt created a new gap.
    fn has_new_missing_packets(&self, space: crate::types::PacketNumberSpace) -> bool;

    fn largest_received(&self, space: crate::types::PacketNumberSpace) -> Option<PacketNumber>;

    /// First packet number the peer may send in this space.
    fn peer_first_sending_packet_number(&self, _space: crate::types::PacketNumberSpace) -> PacketNumber {
        1
    }
}

// ============================================================================
// Session Visitor
// ============================================================================

/// Restricted egress surface handed to the visitor inside callbacks that
/// are expected to produce data.
pub trait SendApi {
    fn send_control_frame(&mut self, frame: Frame) -> bool;
    fn send_stream_data(&mut self, id: StreamId, data: &[u8], offset: u64, fin: bool)
        -> ConsumedData;
    fn send_crypto_data(&mut self, level: EncryptionLevel, data: &[u8], offset: u64) -> usize;
}

/// The stream/session layer above the connection.
pub trait Visitor {
    fn on_stream_frame(&mut self, frame: StreamFrame);
    fn on_crypto_frame(&mut self, frame: CryptoFrame);
    fn on_rst_stream(&mut self, frame: RstStreamFrame);
    fn on_stop_sending(&mut self, frame: StopSendingFrame);
    fn on_window_update_frame(&mut self, frame: WindowUpdateFrame);
    fn on_blocked_frame(&mut self, frame: BlockedFrame);
    fn on_goaway(&mut self, frame: GoAwayFrame);
    fn on_max_streams_frame(&mut self, frame: MaxStreamsFrame);
    fn on_streams_blocked_frame(&mut self, frame: StreamsBlockedFrame);
    fn on_message_received(&mut self, frame: MessageFrame);

    /// The writer unblocked; the session may produce more data.
    fn on_can_write(&mut self, api: &mut dyn SendApi);

    fn willing_and_able_to_write(&self) -> bool;
    fn has_pending_handshake(&self) -> bool;
    fn should_keep_connection_alive(&self) -> bool;

    /// Produce a keep-alive ping.
    fn send_ping(&mut self, api: &mut dyn SendApi);

    /// Produce probing data if any is available; returns whether data was
    /// produced.
    fn send_probing_data(&mut self, api: &mut dyn SendApi) -> bool;

    /// An ack is about to be sent after too many non-retransmittable
    /// packets; bundle something retransmittable.
    fn on_ack_needs_retransmittable_frame(&mut self, api: &mut dyn SendApi);

    fn on_connection_closed(&mut self, error: TransportError, details: &str, source: CloseSource);
    fn on_connection_migration(&mut self, change: AddressChangeType);
    fn on_successful_version_negotiation(&mut self, version: Version);
    fn on_forward_progress_confirmed(&mut self);
    fn on_path_degrading(&mut self);
    fn on_connectivity_probe_received(&mut self, self_addr: SocketAddr, peer_addr: SocketAddr);
    fn allow_self_address_change(&self) -> bool;
    fn on_congestion_window_change(&mut self, now: Instant);
    fn on_write_blocked(&mut self);
}

// ============================================================================
// Debug Visitor
// ============================================================================

/// Optional observational hooks mirroring ingress/egress events. All
/// methods default to no-ops.
pub trait DebugVisitor {
    fn on_packet_sent(&mut self, _packet: &SerializedPacket, _send_time: Instant) {}
    fn on_packet_received(&mut self, _self_addr: SocketAddr, _peer_addr: SocketAddr, _size: usize) {}
    fn on_packet_header(&mut self, _header: &PacketHeader) {}
    fn on_duplicate_packet(&mut self, _packet_number: PacketNumber) {}
    fn on_undecryptable_packet(&mut self) {}
    fn on_ack_frame_start(&mut self, _largest_acked: PacketNumber) {}
    fn on_stream_frame(&mut self, _frame: &StreamFrame) {}
    fn on_ping_frame(&mut self) {}
    fn on_path_challenge_frame(&mut self, _frame: &PathChallengeFrame) {}
    fn on_path_response_frame(&mut self, _frame: &PathResponseFrame) {}
    fn on_connection_close_frame(&mut self, _frame: &ConnectionCloseFrame) {}
    fn on_version_negotiation_packet(&mut self, _versions: &[Version]) {}
    fn on_successful_version_negotiation(&mut self, _version: Version) {}
    fn on_connection_closed(&mut self, _error: TransportError, _details: &str, _source: CloseSource) {}
    fn on_write_blocked(&mut self) {}
    fn on_mtu_probe_sent(&mut self, _target_size: usize) {}
}
