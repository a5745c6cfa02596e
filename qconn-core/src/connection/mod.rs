//! # Connection State Machine
//!
//! The per-connection actor: accepts encrypted datagrams from a single peer,
//! drives version negotiation, encryption-level progression, ack generation,
//! loss detection and congestion signals, path validation, connection
//! migration, MTU discovery, idle/handshake timeouts, and graceful or abrupt
//! closure, and produces encrypted datagrams to send back.
//!
//! The connection owns no sockets and runs no threads. The embedder feeds it
//! datagrams via [`Connection::process_datagram`], time via the injected
//! clock, and scheduled work via [`Connection::on_alarm`]; everything else is
//! reached through the collaborator traits in [`crate::interface`].

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use core::time::Duration;
use rand::RngCore;
use tracing::{debug, error, trace, warn};

use crate::ack::{AckController, AckDecision};
use crate::alarm::{AlarmKind, AlarmTable, ALARM_GRANULARITY};
use crate::config::{ConnectionConfig, ConnectionOption, FeatureGate};
use crate::error::TransportError;
use crate::frames::{
    BlockedFrame, ConnectionCloseFrame, CryptoFrame, Frame, FrameKind, GoAwayFrame,
    MaxStreamsFrame, MessageFrame, PathChallengeFrame, PathResponseFrame, RstStreamFrame,
    StopSendingFrame, StopWaitingFrame, StreamFrame, StreamsBlockedFrame, WindowUpdateFrame,
};
use crate::interface::{
    Clock, ConsumedData, DebugVisitor, Framer, FramerError, FramerVisitor, ManagerError,
    MessageStatus, PacketBuilder, PacketHeader, PacketSink, PacketWriter, PendingRetransmission,
    PerPacketOptions, ReceivedPacketManager, SendApi, SentPacketManager, SerializedPacket,
    Visitor, WriteResult, WriterHandle,
};
use crate::mtu::MtuDiscovery;
use crate::path::{address_change_type, AddressChangeType, PacketContent};
use crate::stats::ConnectionStats;
use crate::types::{
    CloseBehavior, CloseSource, ConnectionId, EncryptionLevel, Instant, PacketNumber,
    PacketNumberSpace, PathChallengePayload, Perspective, StatelessResetToken, StreamId, Version,
    PING_TIMEOUT,
};


/// Stream carrying the crypto handshake in pre-TLS versions.
const CRYPTO_STREAM_ID: StreamId = StreamId(1);

/// Leading bytes of a client hello; stream data starting with these on a
/// non-crypto stream indicates corrupted memory upstream.
const HANDSHAKE_MAGIC: &[u8] = b"CHLO";

/// Receipt timestamps further than this from the clock indicate a confused
/// embedder.
const MAX_RECEIPT_TIME_SKEW: Duration = Duration::from_secs(120);

/// Consecutive packets without retransmittable frames before the next ack
/// asks the session to bundle one.
const MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS: u64 = 19;

/// Floor for the release-time pacing window.
const MIN_RELEASE_TIME_INTO_FUTURE: Duration = Duration::from_millis(1);

/// Fraction of smoothed RTT used for the release-time pacing window.
const RELEASE_TIME_SRTT_FRACTION: f32 = 0.125;

/// Granularity for the long-period ping alarm.
const PING_ALARM_GRANULARITY: Duration = Duration::from_secs(1);

// ============================================================================
// Version Negotiation State
// ============================================================================

/// Progress of version negotiation with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationState {
    StartNegotiation,
    NegotiationInProgress,
    NegotiatedVersion,
}

// ============================================================================
// Connection
// ============================================================================

/// The connection core.
///
/// Single-threaded: the driver owns the connection exclusively and serializes
/// datagram processing, alarm firing, and egress calls.
pub struct Connection<'a> {
    perspective: Perspective,
    connected: bool,

    server_connection_id: ConnectionId,
    client_connection_id: Option<ConnectionId>,

    supported_versions: Vec<Version>,
    version: Version,
    version_negotiation_state: VersionNegotiationState,
    retry_received: bool,
    pending_version_negotiation_packet: Option<bool>,

    self_address: Option<SocketAddr>,
    direct_peer_address: Option<SocketAddr>,
    effective_peer_address: Option<SocketAddr>,
    /// Proxy hook: maps the packet source address to the effective peer.
    effective_peer_address_resolver: Option<Box<dyn Fn(SocketAddr) -> SocketAddr + 'a>>,

    clock: &'a dyn Clock,
    writer: WriterHandle<'a>,
    visitor: Option<Box<dyn Visitor + 'a>>,
    debug_visitor: Option<Box<dyn DebugVisitor + 'a>>,
    framer: Option<Box<dyn Framer + 'a>>,
    builder: Option<Box<dyn PacketBuilder + 'a>>,
    sent_packets: Box<dyn SentPacketManager + 'a>,
    received_packets: Box<dyn ReceivedPacketManager + 'a>,
    rng: Box<dyn RngCore + 'a>,

    features: FeatureGate,
    alarms: AlarmTable,
    ack: AckController,
    mtu: MtuDiscovery,
    stats: ConnectionStats,

    // Config-applied knobs.
    idle_network_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
    ping_timeout: Duration,
    retransmittable_on_wire_timeout: Option<Duration>,
    max_undecryptable_packets: usize,
    idle_timeout_close_behavior: CloseBehavior,
    close_after_5_rtos: bool,
    no_stop_waiting_frames: bool,
    ack_timestamps_enabled: bool,
    pacing_offload_disabled: bool,
    stateless_reset_token: Option<StatelessResetToken>,

    // Encryption state.
    encryption_level: EncryptionLevel,
    has_encrypter: [bool; 4],
    has_decrypter: [bool; 4],
    handshake_confirmed: bool,

    // Per-incoming-packet scratch.
    last_header: Option<PacketHeader>,
    last_size: usize,
    last_decrypted_level: EncryptionLevel,
    last_packet_decrypted: bool,
    last_packet_content: PacketContent,
    last_packet_was_missing: bool,
    should_last_packet_instigate_acks: bool,
    current_effective_peer_migration: AddressChangeType,
    last_packet_source_address: Option<SocketAddr>,
    last_packet_destination_address: Option<SocketAddr>,

    // Ack frame processing scratch.
    processing_ack_frame: bool,
    skip_current_ack_frame: bool,

    // Deferred framer reconfiguration; the framer is detached while it
    // drives callbacks, so these apply when it returns.
    pending_framer_version: Option<Version>,
    pending_initial_crypter_reset: Option<ConnectionId>,

    // Activity timestamps.
    time_of_last_received_packet: Instant,
    time_of_first_packet_sent_after_receiving: Instant,
    first_send_after_receive_pending: bool,

    // Egress state.
    packet_number_of_last_sent_packet: Option<PacketNumber>,
    flusher_attached: bool,
    retransmission_alarm_requested: bool,
    queued_packets: VecDeque<SerializedPacket>,
    termination_packets: Vec<Bytes>,
    consecutive_non_retransmittable_packets: u64,
    probing_retransmission_pending: bool,
    write_error_latched: bool,
    release_time_into_future: Duration,

    // Migration.
    active_migration_type: AddressChangeType,
    highest_packet_sent_before_migration: Option<PacketNumber>,

    // Path validation.
    pending_path_challenge_payloads: VecDeque<PathChallengePayload>,
    transmitted_connectivity_probe_payload: Option<PathChallengePayload>,

    // Stop-waiting bookkeeping.
    peer_least_packet_awaiting_ack: Option<PacketNumber>,

    // Deferred-decode queues.
    undecryptable_packets: VecDeque<Bytes>,
    coalesced_packets: VecDeque<Bytes>,

    close_frame_received: Option<ConnectionCloseFrame>,
}

impl<'a> Connection<'a> {
    /// Create a connection.
    ///
    /// `supported_versions` must be non-empty; the first entry is the
    /// version offered until negotiation settles. The sent- and
    /// received-packet managers, framer, builder, and visitor are owned for
    /// the life of the connection; the clock and (optionally) the writer are
    /// borrowed from the embedder.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        perspective: Perspective,
        server_connection_id: ConnectionId,
        initial_peer_address: SocketAddr,
        supported_versions: Vec<Version>,
        clock: &'a dyn Clock,
        writer: WriterHandle<'a>,
        framer: Box<dyn Framer + 'a>,
        builder: Box<dyn PacketBuilder + 'a>,
        sent_packets: Box<dyn SentPacketManager + 'a>,
        received_packets: Box<dyn ReceivedPacketManager + 'a>,
        visitor: Box<dyn Visitor + 'a>,
        rng: Box<dyn RngCore + 'a>,
        features: FeatureGate,
    ) -> Self {
        debug_assert!(!supported_versions.is_empty());
        debug_assert_eq!(
            features.multiple_packet_number_spaces,
            received_packets.num_spaces() == crate::types::NUM_PACKET_NUMBER_SPACES
        );
        let version = supported_versions[0];
        let num_spaces = received_packets.num_spaces();
        let creation_time = clock.now();
        let mut stats = ConnectionStats::default();
        stats.connection_creation_time = creation_time;

        // The writer caps the datagram size on this path.
        let mut builder = builder;
        let writer_cap = writer.get().max_packet_size(initial_peer_address);
        if writer_cap < builder.max_packet_length() {
            builder.set_max_packet_length(writer_cap);
        }

        debug!(
            ?perspective,
            cid = %server_connection_id,
            peer = %initial_peer_address,
            "creating connection"
        );

        Self {
            perspective,
            connected: true,
            server_connection_id,
            client_connection_id: None,
            no_stop_waiting_frames: version.is_ietf(),
            supported_versions,
            version,
            version_negotiation_state: VersionNegotiationState::StartNegotiation,
            retry_received: false,
            pending_version_negotiation_packet: None,
            self_address: None,
            direct_peer_address: Some(initial_peer_address),
            effective_peer_address: Some(initial_peer_address),
            effective_peer_address_resolver: None,
            clock,
            writer,
            visitor: Some(visitor),
            debug_visitor: None,
            framer: Some(framer),
            builder: Some(builder),
            sent_packets,
            received_packets,
            rng,
            features,
            alarms: AlarmTable::default(),
            ack: AckController::new(num_spaces),
            mtu: MtuDiscovery::default(),
            stats,
            idle_network_timeout: None,
            handshake_timeout: None,
            ping_timeout: PING_TIMEOUT,
            retransmittable_on_wire_timeout: None,
            max_undecryptable_packets: 0,
            idle_timeout_close_behavior: CloseBehavior::SendConnectionClosePacket,
            close_after_5_rtos: false,
            ack_timestamps_enabled: false,
            pacing_offload_disabled: false,
            stateless_reset_token: None,
            encryption_level: EncryptionLevel::Initial,
            has_encrypter: [true, false, false, false],
            has_decrypter: [true, false, false, false],
            handshake_confirmed: false,
            last_header: None,
            last_size: 0,
            last_decrypted_level: EncryptionLevel::Initial,
            last_packet_decrypted: false,
            last_packet_content: PacketContent::NoFramesReceived,
            last_packet_was_missing: false,
            should_last_packet_instigate_acks: false,
            current_effective_peer_migration: AddressChangeType::NoChange,
            last_packet_source_address: None,
            last_packet_destination_address: None,
            processing_ack_frame: false,
            skip_current_ack_frame: false,
            pending_framer_version: None,
            pending_initial_crypter_reset: None,
            time_of_last_received_packet: creation_time,
            time_of_first_packet_sent_after_receiving: Instant::ZERO,
            first_send_after_receive_pending: true,
            packet_number_of_last_sent_packet: None,
            flusher_attached: false,
            retransmission_alarm_requested: false,
            queued_packets: VecDeque::new(),
            termination_packets: Vec::new(),
            consecutive_non_retransmittable_packets: 0,
            probing_retransmission_pending: false,
            write_error_latched: false,
            release_time_into_future: MIN_RELEASE_TIME_INTO_FUTURE,
            active_migration_type: AddressChangeType::NoChange,
            highest_packet_sent_before_migration: None,
            pending_path_challenge_payloads: VecDeque::new(),
            transmitted_connectivity_probe_payload: None,
            peer_least_packet_awaiting_ack: None,
            undecryptable_packets: VecDeque::new(),
            coalesced_packets: VecDeque::new(),
            close_frame_received: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn version_negotiation_state(&self) -> VersionNegotiationState {
        self.version_negotiation_state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    pub fn server_connection_id(&self) -> &ConnectionId {
        &self.server_connection_id
    }

    pub fn self_address(&self) -> Option<SocketAddr> {
        self.self_address
    }

    pub fn direct_peer_address(&self) -> Option<SocketAddr> {
        self.direct_peer_address
    }

    pub fn effective_peer_address(&self) -> Option<SocketAddr> {
        self.effective_peer_address
    }

    pub fn active_migration_type(&self) -> AddressChangeType {
        self.active_migration_type
    }

    pub fn highest_packet_sent_before_migration(&self) -> Option<PacketNumber> {
        self.highest_packet_sent_before_migration
    }

    /// Encrypted copies of every termination packet sent, for hand-off to a
    /// time-wait manager.
    pub fn termination_packets(&self) -> &[Bytes] {
        &self.termination_packets
    }

    pub fn close_frame_received(&self) -> Option<&ConnectionCloseFrame> {
        self.close_frame_received.as_ref()
    }

    pub fn set_debug_visitor(&mut self, debug_visitor: Box<dyn DebugVisitor + 'a>) {
        self.debug_visitor = Some(debug_visitor);
    }

    pub fn set_client_connection_id(&mut self, id: ConnectionId) {
        self.client_connection_id = Some(id);
    }

    /// Install the proxy hook deriving the effective peer address from a
    /// packet's source address.
    pub fn set_effective_peer_address_resolver(
        &mut self,
        resolver: Box<dyn Fn(SocketAddr) -> SocketAddr + 'a>,
    ) {
        self.effective_peer_address_resolver = Some(resolver);
    }

    /// Earliest pending alarm deadline, for the driver's timer loop.
    pub fn next_alarm_deadline(&self) -> Option<Instant> {
        self.alarms.next_deadline()
    }

    #[cfg(test)]
    pub(crate) fn alarm_deadline(&self, kind: AlarmKind) -> Option<Instant> {
        self.alarms.get(kind)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Ingest the negotiated configuration. Called once, before traffic.
    pub fn set_from_config(&mut self, config: &ConnectionConfig) {
        self.ack.configure(config);

        if config.has_option(ConnectionOption::MTUH) {
            self.set_mtu_discovery_target(crate::mtu::MTU_DISCOVERY_TARGET_HIGH);
        } else if config.has_option(ConnectionOption::MTUL)
            || config.has_option(ConnectionOption::KMTU)
        {
            self.set_mtu_discovery_target(crate::mtu::MTU_DISCOVERY_TARGET_LOW);
        }

        self.close_after_5_rtos = config.has_option(ConnectionOption::RTO5);
        if config.has_option(ConnectionOption::NSTP) {
            self.no_stop_waiting_frames = true;
        }
        self.ack_timestamps_enabled = config.has_option(ConnectionOption::STMP);
        self.pacing_offload_disabled = config.has_option(ConnectionOption::NPCO);

        self.max_undecryptable_packets = config.max_undecryptable_packets;
        self.idle_timeout_close_behavior = if config.silent_close {
            CloseBehavior::SilentClose
        } else {
            CloseBehavior::SendConnectionClosePacket
        };
        self.stateless_reset_token = config.stateless_reset_token;
        self.retransmittable_on_wire_timeout = config.retransmittable_on_wire_timeout;

        self.set_network_timeouts(config.handshake_timeout, config.idle_network_timeout);
    }

    /// Install the idle and handshake deadlines.
    ///
    /// The idle timeout is inflated by 3 s on servers and deflated by 1 s on
    /// clients (when above 1 s) so that a client never keeps sending into a
    /// server that already timed out.
    pub fn set_network_timeouts(
        &mut self,
        handshake_timeout: Option<Duration>,
        idle_timeout: Duration,
    ) {
        if let Some(handshake) = handshake_timeout {
            if idle_timeout > handshake {
                debug_assert!(false, "idle timeout exceeds handshake timeout");
                self.stats.bug_count += 1;
            }
        }
        let idle = if self.perspective.is_server() {
            idle_timeout + Duration::from_secs(3)
        } else if idle_timeout > Duration::from_secs(1) {
            idle_timeout - Duration::from_secs(1)
        } else {
            idle_timeout
        };
        self.handshake_timeout = handshake_timeout;
        self.idle_network_timeout = Some(idle);
        self.set_timeout_alarm();
    }

    fn set_mtu_discovery_target(&mut self, target: usize) {
        let current = self
            .builder
            .as_ref()
            .map(|b| b.max_packet_length())
            .unwrap_or(0);
        self.mtu.set_target(target, current);
    }

    // ------------------------------------------------------------------
    // Encryption level progression
    // ------------------------------------------------------------------

    /// The session installed an encrypter for `level`.
    pub fn on_encrypter_installed(&mut self, level: EncryptionLevel) {
        self.has_encrypter[level as usize] = true;
    }

    /// The session installed a decrypter for `level`; buffered undecryptable
    /// packets get another chance.
    pub fn on_decrypter_installed(&mut self, level: EncryptionLevel) {
        self.has_decrypter[level as usize] = true;
        if !self.undecryptable_packets.is_empty() {
            self.alarms
                .update(AlarmKind::ProcessUndecryptable, self.clock.approximate_now(), ALARM_GRANULARITY);
        }
    }

    /// Raise the default encryption level for outgoing packets. Monotonic:
    /// lowering is ignored and counted.
    pub fn set_default_encryption_level(&mut self, level: EncryptionLevel) {
        if level < self.encryption_level {
            debug_assert!(false, "encryption level lowered");
            self.stats.bug_count += 1;
            return;
        }
        self.encryption_level = level;
        self.has_encrypter[level as usize] = true;
        if let Some(builder) = self.builder.as_mut() {
            builder.set_encryption_level(level);
        }
    }

    /// The handshake finished: confirm with the loss machinery and drop
    /// initial-level in-flight packets.
    pub fn on_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
        self.sent_packets.set_handshake_confirmed();
        self.neuter_unencrypted_packets();
    }

    /// Drop initial-level in-flight packets; re-arms the retransmission
    /// alarm.
    pub fn neuter_unencrypted_packets(&mut self) {
        self.sent_packets.neuter_unencrypted_packets();
        self.arm_retransmission_alarm();
    }

    // ------------------------------------------------------------------
    // Ingress pipeline
    // ------------------------------------------------------------------

    /// Process one received UDP datagram.
    pub fn process_datagram(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        packet: Bytes,
        receipt_time: Instant,
    ) {
        if !self.connected {
            self.stats.packets_dropped += 1;
            return;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_packet_received(self_address, peer_address, packet.len());
        }
        trace!(len = packet.len(), peer = %peer_address, "processing datagram");

        self.last_size = packet.len();
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;
        self.last_packet_source_address = Some(peer_address);
        self.last_packet_destination_address = Some(self_address);
        if self.self_address.is_none() {
            self.self_address = Some(self_address);
        }
        if self.direct_peer_address.is_none() {
            self.direct_peer_address = Some(peer_address);
        }
        if self.effective_peer_address.is_none() {
            let effective = self.resolve_effective_peer_address(peer_address);
            self.effective_peer_address = Some(effective);
        }

        let now = self.clock.approximate_now();
        if receipt_time.abs_delta(now) > MAX_RECEIPT_TIME_SKEW {
            self.stats.bug_count += 1;
            warn!(
                receipt = receipt_time.as_nanos(),
                clock = now.as_nanos(),
                "receipt time out of sync with clock"
            );
        }
        self.time_of_last_received_packet = receipt_time;
        self.first_send_after_receive_pending = true;

        // Per-packet scratch.
        self.last_packet_decrypted = false;
        self.last_packet_content = PacketContent::NoFramesReceived;
        self.last_packet_was_missing = false;
        self.should_last_packet_instigate_acks = false;
        self.current_effective_peer_migration = AddressChangeType::NoChange;

        let mut flusher = self.flusher();
        let processed = flusher.run_framer(&packet);
        if !processed {
            flusher.on_framer_failure(&packet);
        } else {
            flusher.stats.packets_processed += 1;
            flusher.maybe_process_coalesced_packets();
            flusher.maybe_process_undecryptable_packets();
            flusher.maybe_send_in_response_to_packet();
        }
        drop(flusher);

        self.set_ping_alarm();
    }

    fn resolve_effective_peer_address(&self, source: SocketAddr) -> SocketAddr {
        match &self.effective_peer_address_resolver {
            Some(resolver) => resolver(source),
            None => source,
        }
    }

    /// Drive the framer over one datagram. The framer is detached for the
    /// duration so its callbacks can borrow the connection mutably.
    fn run_framer(&mut self, packet: &Bytes) -> bool {
        let Some(mut framer) = self.framer.take() else {
            self.stats.bug_count += 1;
            return false;
        };
        let ok = framer.process_packet(packet, self);
        // Apply reconfiguration decided during callbacks.
        if let Some(version) = self.pending_framer_version.take() {
            framer.set_version(version);
        }
        if let Some(cid) = self.pending_initial_crypter_reset.take() {
            framer.reinstall_initial_crypters(&cid);
        }
        self.framer = Some(framer);
        ok
    }

    fn on_framer_failure(&mut self, packet: &Bytes) {
        let err = self.framer.as_ref().and_then(|f| f.last_error());
        match err {
            Some(FramerError::DecryptionFailure) => self.queue_undecryptable_packet(packet),
            Some(FramerError::Protocol(error, details)) => {
                // Only authenticated packets may kill the connection.
                if self.last_packet_decrypted {
                    self.close(error, &details, CloseBehavior::SendConnectionClosePacket);
                } else {
                    self.stats.packets_dropped += 1;
                    debug!(%error, details = %details, "dropping unauthenticated bad packet");
                }
            }
            None => {
                // A callback aborted processing and already accounted for
                // the packet.
                trace!("framer stopped without an error");
            }
        }
    }

    fn queue_undecryptable_packet(&mut self, packet: &Bytes) {
        if self.has_decrypter[EncryptionLevel::ForwardSecure as usize] {
            // Keys will not improve; this packet is garbage.
            self.stats.undecryptable_packets_dropped += 1;
            return;
        }
        if self.undecryptable_packets.len() >= self.max_undecryptable_packets {
            self.stats.undecryptable_packets_dropped += 1;
            debug!("undecryptable packet buffer full, dropping");
            return;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_undecryptable_packet();
        }
        self.undecryptable_packets.push_back(packet.clone());
    }

    fn maybe_process_undecryptable_packets(&mut self) {
        while let Some(packet) = self.undecryptable_packets.pop_front() {
            if !self.connected {
                return;
            }
            trace!("retrying undecryptable packet");
            if !self.run_framer(&packet) {
                let still_undecryptable = matches!(
                    self.framer.as_ref().and_then(|f| f.last_error()),
                    Some(FramerError::DecryptionFailure)
                );
                if still_undecryptable {
                    if self.has_decrypter[EncryptionLevel::ForwardSecure as usize] {
                        // Final keys are in; nothing will ever decrypt this.
                        self.stats.undecryptable_packets_dropped += 1;
                        continue;
                    }
                    self.undecryptable_packets.push_front(packet);
                    return;
                }
            } else {
                self.stats.packets_processed += 1;
            }
        }
    }

    fn maybe_process_coalesced_packets(&mut self) {
        while let Some(packet) = self.coalesced_packets.pop_front() {
            if !self.connected {
                return;
            }
            if self.run_framer(&packet) {
                self.stats.packets_processed += 1;
            } else {
                self.on_framer_failure(&packet);
            }
        }
    }

    fn maybe_send_in_response_to_packet(&mut self) {
        if !self.connected {
            return;
        }
        if !self.writer.get().is_write_blocked() {
            self.write_queued_packets();
        }
        let visitor_has_data = self
            .visitor
            .as_ref()
            .map_or(false, |v| v.willing_and_able_to_write());
        if visitor_has_data || !self.queued_packets.is_empty() {
            let now = self.clock.approximate_now();
            let pacing_delay = self.sent_packets.time_until_send(now);
            self.alarms
                .update(AlarmKind::Send, now + pacing_delay, ALARM_GRANULARITY);
        }
    }

    // ------------------------------------------------------------------
    // Frame handler helpers
    // ------------------------------------------------------------------

    fn update_packet_content(&mut self, kind: FrameKind) {
        self.last_packet_content = self.last_packet_content.update(kind);
    }

    fn last_packet_space(&self) -> PacketNumberSpace {
        if self.features.multiple_packet_number_spaces {
            self.last_decrypted_level.packet_number_space()
        } else {
            PacketNumberSpace::Application
        }
    }

    fn last_packet_number(&self) -> PacketNumber {
        self.last_header.as_ref().map_or(0, |h| h.packet_number)
    }

    fn handle_stateless_reset(&mut self) {
        self.stats.stateless_resets_received += 1;
        warn!("stateless reset received, tearing down");
        self.tear_down(TransportError::PublicReset, "Stateless reset received.", CloseSource::Peer);
    }

    // ------------------------------------------------------------------
    // Probe handling and migration
    // ------------------------------------------------------------------

    fn respond_to_path_probe(&mut self, to_address: SocketAddr) {
        let payloads: Vec<PathChallengePayload> =
            self.pending_path_challenge_payloads.drain(..).collect();
        let packets = self.build_detached(|builder, sink| {
            if payloads.is_empty() {
                builder.build_connectivity_probe(None, sink);
            } else {
                builder.build_path_response(&payloads, sink);
            }
        });
        for packet in packets {
            self.write_probe_packet(packet, None, to_address);
        }
    }

    fn start_effective_peer_migration(&mut self, change: AddressChangeType) {
        let Some(source) = self.last_packet_source_address else {
            return;
        };
        let new_effective = self.resolve_effective_peer_address(source);
        debug!(
            from = ?self.effective_peer_address,
            to = %new_effective,
            ?change,
            "starting effective peer migration"
        );
        self.highest_packet_sent_before_migration = self.sent_packets.largest_sent_packet();
        self.active_migration_type = change;
        self.effective_peer_address = Some(new_effective);
        self.direct_peer_address = Some(source);
        self.stats.peer_migrations += 1;
        if let Some(v) = self.visitor.as_mut() {
            v.on_connection_migration(change);
        }
        self.sent_packets.on_connection_migration(change);
    }

    fn maybe_validate_migration(&mut self) {
        if self.active_migration_type == AddressChangeType::NoChange {
            return;
        }
        let validated = match (self.sent_packets.largest_observed(), self.highest_packet_sent_before_migration) {
            (Some(observed), Some(barrier)) => observed > barrier,
            (Some(_), None) => true,
            _ => false,
        };
        if validated {
            debug!("effective peer migration validated");
            self.active_migration_type = AddressChangeType::NoChange;
            self.highest_packet_sent_before_migration = None;
        }
    }

    // ------------------------------------------------------------------
    // Egress operations
    // ------------------------------------------------------------------

    /// Send stream data; returns how much the builder consumed.
    pub fn send_stream_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        offset: u64,
        fin: bool,
    ) -> ConsumedData {
        if !self.connected {
            return ConsumedData::default();
        }
        let mut flusher = self.flusher();
        flusher.with_builder(ConsumedData::default(), |builder, conn| {
            builder.consume_stream_data(id, data, offset, fin, conn)
        })
    }

    /// Send crypto handshake data at `level`.
    pub fn send_crypto_data(&mut self, level: EncryptionLevel, data: &[u8], offset: u64) -> usize {
        if !self.connected {
            return 0;
        }
        let mut flusher = self.flusher();
        flusher.with_builder(0, |builder, conn| {
            builder.consume_crypto_data(level, data, offset, conn)
        })
    }

    /// Queue one control frame toward the builder.
    pub fn send_control_frame(&mut self, frame: Frame) -> bool {
        if !self.connected {
            debug!("dropping control frame on closed connection");
            return false;
        }
        let mut flusher = self.flusher();
        flusher.with_builder(false, |builder, conn| builder.queue_frame(frame, conn))
    }

    /// Send a MESSAGE frame. Only permitted at forward-secure encryption.
    pub fn send_message(&mut self, message_id: u64, data: &[Bytes]) -> MessageStatus {
        if !self.connected {
            return MessageStatus::InternalError;
        }
        if self.encryption_level != EncryptionLevel::ForwardSecure {
            return MessageStatus::EncryptionNotEstablished;
        }
        let mut flusher = self.flusher();
        flusher.with_builder(MessageStatus::InternalError, |builder, conn| {
            builder.add_message(message_id, data, conn)
        })
    }

    /// Send a version negotiation packet (server side).
    pub fn send_version_negotiation_packet(&mut self, ietf: bool) {
        if !self.connected || self.perspective.is_client() {
            return;
        }
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
        let versions = self.supported_versions.clone();
        let datagram = match self.builder.as_mut() {
            Some(builder) => builder.build_version_negotiation(ietf, &versions),
            None => return,
        };
        let (Some(self_addr), Some(peer_addr)) = (self.self_address, self.direct_peer_address)
        else {
            return;
        };
        if self.writer.get().is_write_blocked() {
            self.pending_version_negotiation_packet = Some(ietf);
            self.notify_write_blocked();
            return;
        }
        let options = PerPacketOptions::default();
        match self.writer.get_mut().write_packet(&datagram, self_addr, peer_addr, &options) {
            WriteResult::Ok(n) => {
                self.pending_version_negotiation_packet = None;
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
            }
            WriteResult::Blocked | WriteResult::BlockedDataBuffered => {
                self.pending_version_negotiation_packet = Some(ietf);
                self.notify_write_blocked();
            }
            WriteResult::MsgTooBig => {}
            WriteResult::Error(code) => self.on_write_error(code),
        }
    }

    /// Send a connectivity probe toward `peer_address`, optionally through a
    /// dedicated probing writer. Returns whether the probe left.
    pub fn send_connectivity_probe(
        &mut self,
        probing_writer: Option<&mut dyn PacketWriter>,
        peer_address: SocketAddr,
    ) -> bool {
        if !self.connected {
            return false;
        }
        let payload = if self.version.is_ietf() {
            let mut payload: PathChallengePayload = Default::default();
            self.rng.fill_bytes(&mut payload);
            self.transmitted_connectivity_probe_payload = Some(payload);
            Some(payload)
        } else {
            None
        };
        let packets = self.build_detached(|builder, sink| {
            builder.build_connectivity_probe(payload, sink);
        });
        if packets.is_empty() {
            self.transmitted_connectivity_probe_payload = None;
            return false;
        }
        let mut probing_writer = probing_writer;
        let mut sent = false;
        for packet in packets {
            sent |= match probing_writer {
                Some(ref mut writer) => self.write_probe_packet(packet, Some(&mut **writer), peer_address),
                None => self.write_probe_packet(packet, None, peer_address),
            };
        }
        sent
    }

    /// Serialize through the builder into a detached buffer instead of the
    /// normal egress path.
    fn build_detached(
        &mut self,
        f: impl FnOnce(&mut dyn PacketBuilder, &mut CollectSink),
    ) -> Vec<SerializedPacket> {
        let Some(mut builder) = self.builder.take() else {
            self.stats.bug_count += 1;
            return Vec::new();
        };
        let mut sink = CollectSink::default();
        f(builder.as_mut(), &mut sink);
        self.builder = Some(builder);
        sink.packets
    }

    fn write_probe_packet(
        &mut self,
        packet: SerializedPacket,
        probing_writer: Option<&mut dyn PacketWriter>,
        peer_address: SocketAddr,
    ) -> bool {
        let Some(self_addr) = self.self_address.or(self.last_packet_destination_address) else {
            return false;
        };
        if let Some(last) = self.packet_number_of_last_sent_packet {
            if packet.packet_number <= last {
                self.close_on_out_of_order_packet();
                return false;
            }
        }
        self.packet_number_of_last_sent_packet = Some(packet.packet_number);
        let send_time = self.clock.now();
        let options = PerPacketOptions::default();
        let result = match probing_writer {
            Some(writer) => writer.write_packet(&packet.encrypted, self_addr, peer_address, &options),
            None => self
                .writer
                .get_mut()
                .write_packet(&packet.encrypted, self_addr, peer_address, &options),
        };
        match result {
            WriteResult::Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
                if let Some(dv) = self.debug_visitor.as_mut() {
                    dv.on_packet_sent(&packet, send_time);
                }
                if self.sent_packets.on_packet_sent(&packet, send_time) {
                    self.request_retransmission_alarm();
                }
                true
            }
            WriteResult::Blocked | WriteResult::BlockedDataBuffered => {
                self.notify_write_blocked();
                false
            }
            WriteResult::MsgTooBig => false,
            WriteResult::Error(code) => {
                self.on_write_error(code);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Serialized packet sink (normal egress path)
    // ------------------------------------------------------------------

    fn write_serialized_packet(&mut self, packet: SerializedPacket) {
        if !self.connected {
            self.stats.packets_discarded += 1;
            return;
        }
        // Obsolete encryption: initial-level packets after final keys.
        if packet.level == EncryptionLevel::Initial
            && self.has_encrypter[EncryptionLevel::ForwardSecure as usize]
        {
            self.stats.packets_discarded += 1;
            debug!(pn = packet.packet_number, "discarding obsolete initial packet");
            return;
        }
        if let Some(last) = self.packet_number_of_last_sent_packet {
            if packet.packet_number <= last {
                self.close_on_out_of_order_packet();
                return;
            }
        }
        self.packet_number_of_last_sent_packet = Some(packet.packet_number);

        if packet.is_termination_packet {
            self.termination_packets.push(packet.encrypted.clone());
        }

        if self.writer.get().is_write_blocked() && !packet.is_termination_packet {
            self.queued_packets.push_back(packet);
            self.notify_write_blocked();
            return;
        }
        self.try_write_packet(packet);
    }

    fn close_on_out_of_order_packet(&mut self) {
        self.stats.bug_count += 1;
        self.close(
            TransportError::InternalError,
            "Packet written out of order.",
            CloseBehavior::SendConnectionClosePacket,
        );
    }

    fn try_write_packet(&mut self, packet: SerializedPacket) {
        let (Some(self_addr), Some(peer_addr)) = (
            self.self_address.or(self.last_packet_destination_address),
            self.direct_peer_address,
        ) else {
            // No path yet; hold the packet until addresses are known.
            self.queued_packets.push_back(packet);
            return;
        };

        // Sample the send time before the write so RTT never shrinks by the
        // cost of the syscall.
        let send_time = self.clock.now();
        let mut options = PerPacketOptions::default();
        if self.writer.get().supports_release_time() && !self.pacing_offload_disabled {
            let delay = self
                .sent_packets
                .next_release_time()
                .map(|t| t.saturating_duration_since(send_time))
                .unwrap_or(Duration::ZERO);
            options.release_time_delay = delay.min(self.release_time_into_future);
        }

        let result = self
            .writer
            .get_mut()
            .write_packet(&packet.encrypted, self_addr, peer_addr, &options);
        trace!(pn = packet.packet_number, ?result, "wrote packet");

        match result {
            WriteResult::Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
            }
            WriteResult::BlockedDataBuffered => {
                // Buffered by the writer: counts as sent, but stop pushing.
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += packet.encrypted.len() as u64;
                self.notify_write_blocked();
            }
            WriteResult::Blocked => {
                self.queued_packets.push_front(packet);
                self.notify_write_blocked();
                return;
            }
            WriteResult::MsgTooBig => {
                if packet.is_mtu_probe {
                    debug!("mtu probe too big, disabling discovery");
                    self.mtu.disable();
                    self.alarms.cancel(AlarmKind::Mtu);
                    return;
                }
                self.stats.packets_discarded += 1;
                return;
            }
            WriteResult::Error(code) => {
                self.on_write_error(code);
                return;
            }
        }

        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_packet_sent(&packet, send_time);
        }

        if packet.has_retransmittable_data {
            if !self.alarms.is_set(AlarmKind::PathDegrading) {
                let delay = self.sent_packets.path_degrading_delay();
                self.alarms.set(AlarmKind::PathDegrading, send_time + delay);
            }
            if self.first_send_after_receive_pending {
                self.time_of_first_packet_sent_after_receiving = send_time;
                self.first_send_after_receive_pending = false;
            }
            self.consecutive_non_retransmittable_packets = 0;
        } else {
            self.consecutive_non_retransmittable_packets += 1;
        }

        if packet.transmission_type.is_retransmission() {
            self.stats.packets_retransmitted += 1;
        }

        let packet_number = packet.packet_number;
        if self.sent_packets.on_packet_sent(&packet, send_time) {
            self.request_retransmission_alarm();
        }

        if self.mtu.should_probe(packet_number) {
            self.alarms
                .update(AlarmKind::Mtu, self.clock.approximate_now(), ALARM_GRANULARITY);
        }
    }

    fn write_queued_packets(&mut self) {
        while let Some(packet) = self.queued_packets.pop_front() {
            if !self.connected {
                return;
            }
            if self.writer.get().is_write_blocked() {
                self.queued_packets.push_front(packet);
                return;
            }
            self.try_write_packet(packet);
        }
    }

    fn notify_write_blocked(&mut self) {
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_write_blocked();
        }
        if let Some(v) = self.visitor.as_mut() {
            v.on_write_blocked();
        }
    }

    fn on_write_error(&mut self, code: i32) {
        if self.write_error_latched {
            return;
        }
        self.write_error_latched = true;
        error!(code, "writer reported fatal error");
        self.close(
            TransportError::PacketWriteError,
            &format!("Writer error: {code}."),
            CloseBehavior::SilentClose,
        );
    }

    /// The driver observed the socket become writable.
    pub fn on_writer_unblocked(&mut self) {
        if !self.connected {
            return;
        }
        self.writer.get_mut().set_writable();
        let mut flusher = self.flusher();
        flusher.write_if_not_blocked();
    }

    fn write_if_not_blocked(&mut self) {
        if self.writer.get().is_write_blocked() {
            return;
        }
        if let Some(ietf) = self.pending_version_negotiation_packet.take() {
            self.send_version_negotiation_packet(ietf);
        }
        self.write_queued_packets();
        if !self.connected {
            return;
        }
        let now = self.clock.approximate_now();
        let willing = self
            .visitor
            .as_ref()
            .map_or(false, |v| v.willing_and_able_to_write());
        if willing && self.sent_packets.can_send(now) {
            self.with_visitor((), |visitor, conn| visitor.on_can_write(conn));
        }
    }

    // ------------------------------------------------------------------
    // Retransmission orchestration
    // ------------------------------------------------------------------

    fn request_retransmission_alarm(&mut self) {
        if self.flusher_attached {
            self.retransmission_alarm_requested = true;
        } else {
            self.arm_retransmission_alarm();
        }
    }

    fn arm_retransmission_alarm(&mut self) {
        match self.sent_packets.retransmission_time() {
            Some(deadline) => self.alarms.update(AlarmKind::Retransmission, deadline, ALARM_GRANULARITY),
            None => self.alarms.cancel(AlarmKind::Retransmission),
        }
    }

    fn on_retransmission_alarm(&mut self, now: Instant) {
        if self.close_after_5_rtos && self.sent_packets.consecutive_rto_count() >= 4 {
            self.close(
                TransportError::TooManyRtos,
                "5 consecutive retransmission timeouts",
                CloseBehavior::SendConnectionClosePacket,
            );
            return;
        }
        self.sent_packets.on_retransmission_timeout();

        let mut flusher = self.flusher();
        flusher.write_pending_retransmissions();
        flusher.maybe_send_probing_retransmissions(now);
        drop(flusher);

        self.arm_retransmission_alarm();
    }

    fn write_pending_retransmissions(&mut self) {
        while self.sent_packets.has_pending_retransmissions() {
            if self.writer.get().is_write_blocked() {
                return;
            }
            let Some(pending) = self.sent_packets.next_pending_retransmission() else {
                return;
            };
            self.reserialize_retransmission(pending);
            if !self.connected {
                return;
            }
        }
    }

    fn reserialize_retransmission(&mut self, pending: PendingRetransmission) {
        trace!(pn = pending.packet_number, "reserializing retransmission");
        self.with_builder((), |builder, conn| {
            for frame in pending.retransmittable_frames {
                builder.queue_frame(frame, conn);
            }
            builder.flush(conn);
        });
    }

    fn maybe_send_probing_retransmissions(&mut self, now: Instant) {
        if !self.features.link_probing
            || self.probing_retransmission_pending
            || self.sent_packets.has_pending_retransmissions()
        {
            return;
        }
        self.probing_retransmission_pending = true;
        while self.connected && self.sent_packets.can_send(now) {
            let produced = self.with_visitor(false, |visitor, conn| visitor.send_probing_data(conn));
            if !produced {
                break;
            }
        }
        self.probing_retransmission_pending = false;
    }

    // ------------------------------------------------------------------
    // Alarms
    // ------------------------------------------------------------------

    /// Fire every alarm due at `now`, earliest first.
    pub fn on_alarm(&mut self, now: Instant) {
        while self.connected {
            let Some(kind) = self.alarms.expire_next(now) else {
                return;
            };
            trace!(?kind, "alarm fired");
            match kind {
                AlarmKind::Ack => self.on_ack_alarm(now),
                AlarmKind::Retransmission => self.on_retransmission_alarm(now),
                AlarmKind::Send => {
                    let mut flusher = self.flusher();
                    flusher.write_if_not_blocked();
                }
                AlarmKind::Timeout => self.check_for_timeout(now),
                AlarmKind::Ping => self.on_ping_alarm(),
                AlarmKind::Mtu => self.on_mtu_discovery_alarm(),
                AlarmKind::PathDegrading => self.on_path_degrading_alarm(),
                AlarmKind::ProcessUndecryptable => {
                    let mut flusher = self.flusher();
                    flusher.maybe_process_undecryptable_packets();
                }
            }
        }
    }

    fn on_ack_alarm(&mut self, now: Instant) {
        for space in PacketNumberSpace::ALL {
            if self.ack.ack_due(space, now) {
                self.ack.queue_ack(space);
            }
        }
        // Flusher exit emits the queued acks and re-arms the alarm.
        let _flusher = self.flusher();
    }

    fn on_ping_alarm(&mut self) {
        let mut flusher = self.flusher();
        flusher.with_visitor((), |visitor, conn| visitor.send_ping(conn));
    }

    fn on_mtu_discovery_alarm(&mut self) {
        let largest_sent = self.packet_number_of_last_sent_packet.unwrap_or(0);
        let Some(target) = self.mtu.on_probe_due(largest_sent) else {
            return;
        };
        debug!(target, probe = self.mtu.probe_count(), "sending mtu probe");
        let mut flusher = self.flusher();
        flusher.with_builder(false, |builder, conn| builder.build_mtu_probe(target, conn));
        flusher.stats.mtu_probes_sent += 1;
        if let Some(dv) = flusher.debug_visitor.as_mut() {
            dv.on_mtu_probe_sent(target);
        }
    }

    fn on_path_degrading_alarm(&mut self) {
        warn!("path degrading: no forward progress within the expected delay");
        if let Some(v) = self.visitor.as_mut() {
            v.on_path_degrading();
        }
    }

    // ------------------------------------------------------------------
    // Timeouts and keep-alive
    // ------------------------------------------------------------------

    fn time_of_last_packet(&self) -> Instant {
        self.time_of_last_received_packet
            .max(self.time_of_first_packet_sent_after_receiving)
    }

    fn check_for_timeout(&mut self, now: Instant) {
        let idle_duration = now.saturating_duration_since(self.time_of_last_packet());
        if let Some(idle_timeout) = self.idle_network_timeout {
            if idle_duration >= idle_timeout {
                let details = "No recent network activity.";
                let keep_alive = self
                    .visitor
                    .as_ref()
                    .map_or(false, |v| v.should_keep_connection_alive());
                let behavior = if self.sent_packets.consecutive_tlp_count() > 0
                    || self.sent_packets.consecutive_rto_count() > 0
                    || keep_alive
                {
                    CloseBehavior::SendConnectionClosePacket
                } else {
                    self.idle_timeout_close_behavior
                };
                self.close(TransportError::NetworkIdleTimeout, details, behavior);
                return;
            }
        }
        if let Some(handshake_timeout) = self.handshake_timeout {
            let connected_duration =
                now.saturating_duration_since(self.stats.connection_creation_time);
            if connected_duration >= handshake_timeout {
                self.close(
                    TransportError::HandshakeTimeout,
                    "Handshake timeout expired.",
                    CloseBehavior::SendConnectionClosePacket,
                );
                return;
            }
        }
        self.set_timeout_alarm();
    }

    fn set_timeout_alarm(&mut self) {
        let mut deadline = match self.idle_network_timeout {
            Some(idle) => Some(self.time_of_last_packet() + idle),
            None => None,
        };
        if let Some(handshake) = self.handshake_timeout {
            let handshake_deadline = self.stats.connection_creation_time + handshake;
            deadline = Some(deadline.map_or(handshake_deadline, |d| d.min(handshake_deadline)));
        }
        match deadline {
            Some(d) => self.alarms.set(AlarmKind::Timeout, d),
            None => self.alarms.cancel(AlarmKind::Timeout),
        }
    }

    fn set_ping_alarm(&mut self) {
        if !self.connected {
            return;
        }
        if self.perspective.is_server() {
            // Only clients ping, keeping NAT bindings fresh.
            return;
        }
        let keep_alive = self
            .visitor
            .as_ref()
            .map_or(false, |v| v.should_keep_connection_alive());
        if !keep_alive {
            self.alarms.cancel(AlarmKind::Ping);
            return;
        }
        let now = self.clock.approximate_now();
        match self.retransmittable_on_wire_timeout {
            Some(short) if !self.sent_packets.has_in_flight_packets() => {
                debug_assert!(short < self.ping_timeout);
                self.alarms.update(AlarmKind::Ping, now + short, ALARM_GRANULARITY);
            }
            _ => {
                self.alarms
                    .update(AlarmKind::Ping, now + self.ping_timeout, PING_ALARM_GRANULARITY);
            }
        }
    }

    // ------------------------------------------------------------------
    // Close protocol
    // ------------------------------------------------------------------

    /// Close the connection. Sends a CONNECTION_CLOSE packet unless told to
    /// stay silent, then tears down local state. Idempotent.
    pub fn close(&mut self, error: TransportError, details: &str, behavior: CloseBehavior) {
        if !self.connected {
            return;
        }
        debug!(%error, details, ?behavior, "closing connection");
        if behavior == CloseBehavior::SendConnectionClosePacket {
            self.send_connection_close_packet(error, details);
        }
        self.tear_down(error, details, CloseSource::Local);
    }

    fn send_connection_close_packet(&mut self, error: TransportError, details: &str) {
        let level = self.select_close_encryption_level();
        self.queued_packets.clear();

        let space = if self.features.multiple_packet_number_spaces {
            level.packet_number_space()
        } else {
            PacketNumberSpace::Application
        };
        let now = self.clock.approximate_now();
        let transport_close = self.version.is_ietf();
        let ack_frame = if self.received_packets.is_ack_frame_updated(space) {
            Some(self.received_packets.ack_frame(space, now))
        } else {
            None
        };
        let error_code = error.to_wire();
        let details = details.to_string();
        self.encryption_level = level;
        self.with_builder((), |builder, conn| {
            builder.set_encryption_level(level);
            if let Some(mut frame) = ack_frame {
                if !conn.ack_timestamps_enabled {
                    frame.timestamps.clear();
                }
                let largest = frame.largest_acked;
                builder.queue_frame(Frame::Ack(frame), conn);
                conn.ack.on_ack_sent(space, largest);
            }
            builder.queue_frame(
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    details,
                    transport_close,
                }),
                conn,
            );
            builder.flush(conn);
        });
    }

    /// Which encryption level a CONNECTION_CLOSE should use.
    fn select_close_encryption_level(&self) -> EncryptionLevel {
        if self.perspective.is_client() {
            return self.encryption_level;
        }
        if self.handshake_confirmed {
            EncryptionLevel::ForwardSecure
        } else if self.has_encrypter[EncryptionLevel::ZeroRtt as usize] {
            EncryptionLevel::ZeroRtt
        } else {
            EncryptionLevel::Initial
        }
    }

    fn tear_down(&mut self, error: TransportError, details: &str, source: CloseSource) {
        if !self.connected {
            return;
        }
        debug!(%error, details, ?source, "tearing down connection");
        self.connected = false;

        if self.writer.get().is_batch_mode() {
            self.writer.get_mut().flush();
        }
        if let Some(v) = self.visitor.as_mut() {
            v.on_connection_closed(error, details, source);
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_connection_closed(error, details, source);
        }
        self.alarms.cancel_all();
        self.queued_packets.clear();
        self.undecryptable_packets.clear();
        self.coalesced_packets.clear();
        self.pending_path_challenge_payloads.clear();
        if let Some(builder) = self.builder.as_mut() {
            builder.clear_pending();
        }
    }

    // ------------------------------------------------------------------
    // Flusher
    // ------------------------------------------------------------------

    fn flusher(&mut self) -> ScopedPacketFlusher<'_, 'a> {
        let outermost = !self.flusher_attached;
        if outermost {
            self.flusher_attached = true;
        }
        ScopedPacketFlusher { conn: self, outermost }
    }

    fn end_flush(&mut self) {
        if self.connected {
            self.flush_pending_acks();
            self.with_builder((), |builder, conn| builder.flush(conn));
        }
        if self.connected && !self.writer.get().is_write_blocked() {
            self.write_queued_packets();
            if self.writer.get().is_batch_mode() {
                self.writer.get_mut().flush();
            }
        }
        self.flusher_attached = false;

        // Teardown mid-scope: nothing may re-arm after cancel_all.
        if !self.connected {
            self.retransmission_alarm_requested = false;
            self.alarms.cancel_all();
            return;
        }

        // Ack alarm reconciliation.
        if self.writer.get().is_write_blocked() {
            self.alarms.cancel(AlarmKind::Ack);
        } else {
            match self.ack.earliest_deadline() {
                Some(deadline) => self.alarms.update(AlarmKind::Ack, deadline, ALARM_GRANULARITY),
                None => self.alarms.cancel(AlarmKind::Ack),
            }
        }

        if self.retransmission_alarm_requested {
            self.retransmission_alarm_requested = false;
            self.arm_retransmission_alarm();
        }
    }

    /// Emit an ack (and stop-waiting, when enabled) for every space with a
    /// queued ack, switching encryption level per space as needed.
    fn flush_pending_acks(&mut self) {
        if !self.connected {
            return;
        }
        let now = self.clock.approximate_now();
        let restore_level = self.encryption_level;
        let spaces: Vec<PacketNumberSpace> = self.ack.spaces().collect();
        for space in spaces {
            if !self.connected {
                return;
            }
            if !self.ack.ack_queued(space) {
                continue;
            }
            let multi = self.features.multiple_packet_number_spaces;
            let level = if multi {
                let level = match space {
                    PacketNumberSpace::Application => restore_level.max(EncryptionLevel::ZeroRtt),
                    other => other.encryption_level(),
                };
                if !self.has_encrypter[level as usize] {
                    // Keys for this space are gone or not yet present.
                    continue;
                }
                level
            } else {
                restore_level
            };

            if self.consecutive_non_retransmittable_packets
                >= MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS
            {
                self.consecutive_non_retransmittable_packets = 0;
                self.with_visitor((), |visitor, conn| {
                    visitor.on_ack_needs_retransmittable_frame(conn)
                });
            }

            let mut frame = self.received_packets.ack_frame(space, now);
            if !self.ack_timestamps_enabled {
                frame.timestamps.clear();
            }
            let largest = frame.largest_acked;
            let stop_waiting = if self.no_stop_waiting_frames {
                None
            } else {
                Some(StopWaitingFrame { least_unacked: self.sent_packets.least_unacked() })
            };
            self.with_builder((), |builder, conn| {
                if multi {
                    builder.set_encryption_level(level);
                }
                builder.queue_frame(Frame::Ack(frame), conn);
                if let Some(sw) = stop_waiting {
                    builder.queue_frame(Frame::StopWaiting(sw), conn);
                }
                builder.flush(conn);
                if multi {
                    builder.set_encryption_level(restore_level);
                }
            });
            self.ack.on_ack_sent(space, largest);
        }
    }

    // ------------------------------------------------------------------
    // Collaborator take-and-restore helpers
    // ------------------------------------------------------------------

    /// Run `f` with the builder detached so it can call back into the
    /// connection as a [`PacketSink`]. Reentrant use (a close triggered
    /// while the builder is flushing) falls back to `default`.
    fn with_builder<R>(
        &mut self,
        default: R,
        f: impl FnOnce(&mut dyn PacketBuilder, &mut Self) -> R,
    ) -> R {
        let Some(mut builder) = self.builder.take() else {
            return default;
        };
        let result = f(builder.as_mut(), self);
        self.builder = Some(builder);
        result
    }

    /// Run `f` with the visitor detached so it can drive the connection's
    /// send surface.
    fn with_visitor<R>(
        &mut self,
        default: R,
        f: impl FnOnce(&mut dyn Visitor, &mut Self) -> R,
    ) -> R {
        let Some(mut visitor) = self.visitor.take() else {
            return default;
        };
        let result = f(visitor.as_mut(), self);
        self.visitor = Some(visitor);
        result
    }
}

// ============================================================================
// Scoped Packet Flusher
// ============================================================================

/// Scoped acquisition of the packet flusher.
///
/// On drop of the outermost scope: pending acks are bundled, the builder is
/// flushed, queued packets drain to the writer, and the ack and
/// retransmission alarms are reconciled. Nested scopes are no-ops, so every
/// egress operation can bracket itself without coordination.
pub struct ScopedPacketFlusher<'c, 'a> {
    conn: &'c mut Connection<'a>,
    outermost: bool,
}

impl<'c, 'a> core::ops::Deref for ScopedPacketFlusher<'c, 'a> {
    type Target = Connection<'a>;

    fn deref(&self) -> &Connection<'a> {
        self.conn
    }
}

impl<'c, 'a> core::ops::DerefMut for ScopedPacketFlusher<'c, 'a> {
    fn deref_mut(&mut self) -> &mut Connection<'a> {
        self.conn
    }
}

impl Drop for ScopedPacketFlusher<'_, '_> {
    fn drop(&mut self) {
        if self.outermost {
            self.conn.end_flush();
        }
    }
}

// ============================================================================
// Packet Sink (builder -> connection)
// ============================================================================

impl PacketSink for Connection<'_> {
    fn on_serialized_packet(&mut self, packet: SerializedPacket) {
        self.write_serialized_packet(packet);
    }
}

/// Sink that collects packets instead of writing them, for probes that
/// bypass the normal egress path.
#[derive(Default)]
struct CollectSink {
    packets: Vec<SerializedPacket>,
}

impl PacketSink for CollectSink {
    fn on_serialized_packet(&mut self, packet: SerializedPacket) {
        self.packets.push(packet);
    }
}

// ============================================================================
// Send Api (visitor -> connection)
// ============================================================================

impl SendApi for Connection<'_> {
    fn send_control_frame(&mut self, frame: Frame) -> bool {
        Connection::send_control_frame(self, frame)
    }

    fn send_stream_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        offset: u64,
        fin: bool,
    ) -> ConsumedData {
        Connection::send_stream_data(self, id, data, offset, fin)
    }

    fn send_crypto_data(&mut self, level: EncryptionLevel, data: &[u8], offset: u64) -> usize {
        Connection::send_crypto_data(self, level, data, offset)
    }
}

// ============================================================================
// Framer Visitor (framer -> connection)
// ============================================================================

impl FramerVisitor for Connection<'_> {
    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool {
        if !self.connected {
            return false;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_packet_header(header);
        }

        if self.builder.as_ref().map_or(false, |b| b.has_pending_frames()) {
            let details = "Pending frames must be serialized before incoming packets are processed.";
            self.stats.bug_count += 1;
            debug_assert!(false, "{details}");
            self.close(
                TransportError::InternalError,
                details,
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }

        // Single-space mode can reject duplicates before decryption; the
        // packet number is already authenticated by this callback's caller.
        if !self.features.multiple_packet_number_spaces {
            let space = PacketNumberSpace::Application;
            if !self.received_packets.is_awaiting_packet(space, header.packet_number) {
                if let (Some(token), Some(ours)) =
                    (header.possible_stateless_reset_token, self.stateless_reset_token)
                {
                    if token == ours {
                        self.handle_stateless_reset();
                        return false;
                    }
                }
                trace!(pn = header.packet_number, "packet no longer awaited, discarding");
                if let Some(dv) = self.debug_visitor.as_mut() {
                    dv.on_duplicate_packet(header.packet_number);
                }
                self.stats.packets_dropped += 1;
                return false;
            }
        }

        if self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion
            && self.perspective.is_server()
        {
            if !header.version_flag {
                let details = format!(
                    "Packet {} without version flag before version negotiated.",
                    header.packet_number
                );
                warn!("{details}");
                self.close(
                    TransportError::InvalidVersion,
                    &details,
                    CloseBehavior::SendConnectionClosePacket,
                );
                return false;
            }
            match header.version {
                Some(v) if self.supported_versions.contains(&v) => {
                    self.version = v;
                    self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
                    self.pending_framer_version = Some(v);
                    if let Some(visitor) = self.visitor.as_mut() {
                        visitor.on_successful_version_negotiation(v);
                    }
                    if let Some(dv) = self.debug_visitor.as_mut() {
                        dv.on_successful_version_negotiation(v);
                    }
                }
                _ => {
                    // Unsupported version: offer ours and drop the packet.
                    self.send_version_negotiation_packet(self.version.is_ietf());
                    return false;
                }
            }
        }
        true
    }

    fn on_decrypted_packet(&mut self, level: EncryptionLevel) {
        self.last_decrypted_level = level;
        self.last_packet_decrypted = true;
        // A forward-secure packet from the client proves the handshake
        // completed on both ends.
        if level == EncryptionLevel::ForwardSecure && self.perspective.is_server() {
            if !self.handshake_confirmed {
                self.handshake_confirmed = true;
                self.sent_packets.set_handshake_confirmed();
                self.request_retransmission_alarm();
            }
        }
    }

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        if !self.connected {
            return false;
        }
        let space = self.last_packet_space();
        if self.features.multiple_packet_number_spaces
            && !self.received_packets.is_awaiting_packet(space, header.packet_number)
        {
            trace!(pn = header.packet_number, "packet no longer awaited, discarding");
            if let Some(dv) = self.debug_visitor.as_mut() {
                dv.on_duplicate_packet(header.packet_number);
            }
            self.stats.packets_dropped += 1;
            return false;
        }

        // Self-address migration needs the session's consent.
        if let (Some(current), Some(destination)) =
            (self.self_address, self.last_packet_destination_address)
        {
            if current != destination {
                let allowed = self
                    .visitor
                    .as_ref()
                    .map_or(false, |v| v.allow_self_address_change());
                if allowed {
                    self.self_address = Some(destination);
                } else {
                    self.close(
                        TransportError::ErrorMigratingAddress,
                        "Self address migration is not supported.",
                        CloseBehavior::SendConnectionClosePacket,
                    );
                    return false;
                }
            }
        }

        self.last_packet_was_missing = self
            .received_packets
            .largest_received(space)
            .map_or(false, |largest| header.packet_number < largest);
        self.received_packets
            .record_packet_received(space, header, self.time_of_last_received_packet);

        // Candidate effective peer migration, settled at packet completion
        // once probe status is known.
        if let (Some(effective), Some(source)) =
            (self.effective_peer_address, self.last_packet_source_address)
        {
            let candidate = self.resolve_effective_peer_address(source);
            self.current_effective_peer_migration = address_change_type(effective, candidate);
        }

        if self.perspective.is_client()
            && self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion
        {
            // The server replied with our version; negotiation is settled.
            self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
            let version = self.version;
            if let Some(visitor) = self.visitor.as_mut() {
                visitor.on_successful_version_negotiation(version);
            }
            if let Some(dv) = self.debug_visitor.as_mut() {
                dv.on_successful_version_negotiation(version);
            }
        }

        self.last_header = Some(header.clone());
        true
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Stream);
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_stream_frame(&frame);
        }
        if frame.stream_id != CRYPTO_STREAM_ID
            && self.last_decrypted_level == EncryptionLevel::Initial
        {
            if frame.data.starts_with(HANDSHAKE_MAGIC) {
                // A handshake preamble on a data stream points at memory
                // corruption upstream, not at the peer.
                self.close(
                    TransportError::MaybeCorruptedMemory,
                    "Received crypto frame on non crypto stream.",
                    CloseBehavior::SendConnectionClosePacket,
                );
                return false;
            }
            warn!(stream = frame.stream_id.0, "unencrypted stream data, closing");
            self.close(
                TransportError::UnencryptedStreamData,
                "Unencrypted stream data seen.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        if let Some(v) = self.visitor.as_mut() {
            v.on_stream_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_crypto_frame(&mut self, frame: CryptoFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Crypto);
        if let Some(v) = self.visitor.as_mut() {
            v.on_crypto_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_ack_frame_start(&mut self, largest_acked: PacketNumber, ack_delay: Duration) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Ack);
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_ack_frame_start(largest_acked);
        }
        if self.processing_ack_frame {
            self.close(
                TransportError::InvalidAckData,
                "Received a new ack while processing an ack frame.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        let space = self.last_packet_space();
        let packet_number = self.last_packet_number();
        if self
            .ack
            .largest_received_with_ack(space)
            .map_or(false, |largest| packet_number <= largest)
        {
            trace!(pn = packet_number, "old ack frame, ignoring");
            self.skip_current_ack_frame = true;
            return true;
        }
        if self
            .sent_packets
            .largest_sent_packet()
            .map_or(true, |largest_sent| largest_acked > largest_sent)
        {
            warn!(largest_acked, "peer acked an unsent packet");
            self.close(
                TransportError::InvalidAckData,
                "Largest observed too high.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        if self
            .sent_packets
            .largest_observed()
            .map_or(false, |observed| largest_acked < observed)
            && !self.sent_packets.tolerate_reneging()
        {
            warn!(largest_acked, "peer renegged on a previous ack");
            self.close(
                TransportError::InvalidAckData,
                "Largest observed too low.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        self.processing_ack_frame = true;
        self.sent_packets
            .on_ack_frame_start(largest_acked, ack_delay, self.time_of_last_received_packet);
        true
    }

    fn on_ack_range(&mut self, start: PacketNumber, end: PacketNumber) -> bool {
        if !self.connected {
            return false;
        }
        if self.skip_current_ack_frame {
            return true;
        }
        self.sent_packets.on_ack_range(start, end);
        true
    }

    fn on_ack_timestamp(&mut self, packet_number: PacketNumber, timestamp: Instant) -> bool {
        if !self.connected {
            return false;
        }
        if self.skip_current_ack_frame {
            return true;
        }
        self.sent_packets.on_ack_timestamp(packet_number, timestamp);
        true
    }

    fn on_ack_frame_end(&mut self, _start: PacketNumber) -> bool {
        if !self.connected {
            return false;
        }
        if self.skip_current_ack_frame {
            self.skip_current_ack_frame = false;
            return true;
        }
        self.processing_ack_frame = false;
        let now = self.clock.approximate_now();
        let acked_new = match self.sent_packets.on_ack_frame_end(now) {
            Ok(acked_new) => acked_new,
            Err(ManagerError { error, details }) => {
                self.close(error, &details, CloseBehavior::SendConnectionClosePacket);
                return false;
            }
        };

        // New ack means new pacing; the send alarm re-arms on demand.
        self.alarms.cancel(AlarmKind::Send);

        if self.writer.get().supports_release_time() && !self.pacing_offload_disabled {
            self.release_time_into_future = MIN_RELEASE_TIME_INTO_FUTURE
                .max(self.sent_packets.smoothed_rtt().mul_f32(RELEASE_TIME_SRTT_FRACTION));
        }

        let space = self.last_packet_space();
        let packet_number = self.last_packet_number();
        self.ack.set_largest_received_with_ack(space, packet_number);

        if acked_new {
            self.ack.on_ack_with_new_largest();
            self.with_visitor((), |visitor, conn| {
                visitor.on_forward_progress_confirmed();
                visitor.on_congestion_window_change(conn.clock.approximate_now());
            });
            self.alarms.cancel(AlarmKind::PathDegrading);
            if self.sent_packets.has_in_flight_packets() {
                let delay = self.sent_packets.path_degrading_delay();
                self.alarms.set(AlarmKind::PathDegrading, now + delay);
            }
            self.maybe_validate_migration();
        }

        self.request_retransmission_alarm();
        self.connected
    }

    fn on_stop_waiting_frame(&mut self, frame: StopWaitingFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::StopWaiting);
        if self.no_stop_waiting_frames {
            return true;
        }
        let space = self.last_packet_space();
        let packet_number = self.last_packet_number();
        if self
            .ack
            .largest_received_with_stop_waiting(space)
            .map_or(false, |largest| packet_number <= largest)
        {
            trace!(pn = packet_number, "old stop waiting frame, ignoring");
            return true;
        }
        if self
            .peer_least_packet_awaiting_ack
            .map_or(false, |prev| frame.least_unacked < prev)
        {
            self.close(
                TransportError::InvalidStopWaitingData,
                "Least unacked moved backwards.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        if frame.least_unacked > packet_number {
            self.close(
                TransportError::InvalidStopWaitingData,
                "Least unacked exceeds the enclosing packet number.",
                CloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        self.ack.set_largest_received_with_stop_waiting(space, packet_number);
        self.peer_least_packet_awaiting_ack = Some(frame.least_unacked);
        self.received_packets
            .dont_wait_for_packets_before(space, frame.least_unacked);
        true
    }

    fn on_padding_frame(&mut self, _num_bytes: usize) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Padding);
        true
    }

    fn on_ping_frame(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Ping);
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_ping_frame();
        }
        self.should_last_packet_instigate_acks = true;
        true
    }

    fn on_rst_stream_frame(&mut self, frame: RstStreamFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::RstStream);
        if let Some(v) = self.visitor.as_mut() {
            v.on_rst_stream(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_stop_sending_frame(&mut self, frame: StopSendingFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::StopSending);
        if let Some(v) = self.visitor.as_mut() {
            v.on_stop_sending(frame);
        }
        self.connected
    }

    fn on_window_update_frame(&mut self, frame: WindowUpdateFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::WindowUpdate);
        if let Some(v) = self.visitor.as_mut() {
            v.on_window_update_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_blocked_frame(&mut self, frame: BlockedFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Blocked);
        if let Some(v) = self.visitor.as_mut() {
            v.on_blocked_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_goaway_frame(&mut self, frame: GoAwayFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::GoAway);
        if let Some(v) = self.visitor.as_mut() {
            v.on_goaway(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_max_streams_frame(&mut self, frame: MaxStreamsFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::MaxStreams);
        if let Some(v) = self.visitor.as_mut() {
            v.on_max_streams_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_streams_blocked_frame(&mut self, frame: StreamsBlockedFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::StreamsBlocked);
        if let Some(v) = self.visitor.as_mut() {
            v.on_streams_blocked_frame(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_message_frame(&mut self, frame: MessageFrame) -> bool {
        if !self.connected {
            return false;
        }
        self.update_packet_content(FrameKind::Message);
        if let Some(v) = self.visitor.as_mut() {
            v.on_message_received(frame);
        }
        self.should_last_packet_instigate_acks = true;
        self.connected
    }

    fn on_path_challenge_frame(&mut self, frame: PathChallengeFrame) -> bool {
        if !self.connected {
            return false;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_path_challenge_frame(&frame);
        }
        self.update_packet_content(FrameKind::PathChallenge);
        self.pending_path_challenge_payloads.push_back(frame.payload);
        self.should_last_packet_instigate_acks = true;
        true
    }

    fn on_path_response_frame(&mut self, frame: PathResponseFrame) -> bool {
        if !self.connected {
            return false;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_path_response_frame(&frame);
        }
        self.update_packet_content(FrameKind::PathResponse);
        self.should_last_packet_instigate_acks = true;
        match self.transmitted_connectivity_probe_payload {
            Some(sent) if sent == frame.payload => {
                self.transmitted_connectivity_probe_payload = None;
            }
            _ => {
                trace!("path response does not match an outstanding probe, ignoring");
            }
        }
        true
    }

    fn on_connection_close_frame(&mut self, frame: ConnectionCloseFrame) -> bool {
        if !self.connected {
            return false;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_connection_close_frame(&frame);
        }
        debug!(code = frame.error_code, details = %frame.details, "peer closed connection");
        let error = TransportError::from_wire(frame.error_code);
        let details = frame.details.clone();
        self.close_frame_received = Some(frame);
        self.tear_down(error, &details, CloseSource::Peer);
        false
    }

    fn on_version_negotiation_packet(&mut self, versions: Vec<Version>) {
        if !self.connected {
            return;
        }
        if let Some(dv) = self.debug_visitor.as_mut() {
            dv.on_version_negotiation_packet(&versions);
        }
        if self.perspective.is_server()
            || self.version_negotiation_state != VersionNegotiationState::StartNegotiation
        {
            self.stats.packets_dropped += 1;
            return;
        }
        if versions.contains(&self.version) {
            // The peer negotiated away a version it accepts; broken peer.
            self.close(
                TransportError::InvalidVersionNegotiationPacket,
                "Peer's version negotiation packet included our version.",
                CloseBehavior::SilentClose,
            );
            return;
        }
        let Some(&selected) = self
            .supported_versions
            .iter()
            .find(|ours| versions.contains(ours))
        else {
            self.close(
                TransportError::InvalidVersion,
                "No common version found.",
                CloseBehavior::SilentClose,
            );
            return;
        };
        if selected.handshake != self.version.handshake {
            self.close(
                TransportError::InvalidVersion,
                "Version negotiation across handshake protocols is not supported.",
                CloseBehavior::SilentClose,
            );
            return;
        }
        debug!(version = selected.number, "version negotiated");
        self.version = selected;
        self.no_stop_waiting_frames = selected.is_ietf() || self.no_stop_waiting_frames;
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
        self.pending_framer_version = Some(selected);
        self.sent_packets.retransmit_all_unacked();
        self.request_retransmission_alarm();
    }

    fn on_retry_packet(
        &mut self,
        original_connection_id: ConnectionId,
        new_connection_id: ConnectionId,
        retry_token: Bytes,
    ) {
        if !self.connected || self.perspective.is_server() {
            return;
        }
        if self.retry_received {
            trace!("subsequent retry packet ignored");
            return;
        }
        if original_connection_id != self.server_connection_id {
            self.stats.packets_dropped += 1;
            return;
        }
        self.retry_received = true;
        debug!(new_cid = %new_connection_id, "retry accepted");
        self.server_connection_id = new_connection_id;
        if let Some(builder) = self.builder.as_mut() {
            builder.set_retry_token(retry_token);
        }
        self.pending_initial_crypter_reset = Some(new_connection_id);
        self.sent_packets.retransmit_all_unacked();
        self.request_retransmission_alarm();
    }

    fn on_authenticated_stateless_reset(&mut self, _token: StatelessResetToken) {
        if !self.connected {
            return;
        }
        self.handle_stateless_reset();
    }

    fn on_coalesced_packet(&mut self, packet: Bytes) {
        if !self.connected {
            return;
        }
        self.coalesced_packets.push_back(packet);
    }

    fn on_packet_complete(&mut self) {
        if !self.connected {
            return;
        }
        let space = self.last_packet_space();
        let packet_number = self.last_packet_number();
        trace!(pn = packet_number, content = ?self.last_packet_content, "packet complete");

        let is_probe = self.last_packet_content.is_connectivity_probe();
        let source = self.last_packet_source_address;

        if is_probe {
            self.stats.probes_received += 1;
            if let (Some(self_addr), Some(peer_addr)) =
                (self.last_packet_destination_address, source)
            {
                if let Some(v) = self.visitor.as_mut() {
                    v.on_connectivity_probe_received(self_addr, peer_addr);
                }
                if self.perspective.is_server() {
                    // Echo exactly one probe response to the packet source.
                    self.respond_to_path_probe(peer_addr);
                }
            }
        }
        if !self.pending_path_challenge_payloads.is_empty() {
            if let Some(peer_addr) = source {
                self.respond_to_path_probe(peer_addr);
            }
        }

        if !is_probe
            && self.current_effective_peer_migration != AddressChangeType::NoChange
            && self.received_packets.largest_received(space) == Some(packet_number)
        {
            let change = self.current_effective_peer_migration;
            self.start_effective_peer_migration(change);
        }
        self.current_effective_peer_migration = AddressChangeType::NoChange;

        let decision = self.ack.on_packet_received(
            space,
            packet_number,
            self.time_of_last_received_packet,
            self.should_last_packet_instigate_acks,
            self.last_packet_was_missing,
            self.received_packets.peer_first_sending_packet_number(space),
            self.received_packets.has_new_missing_packets(space),
            self.sent_packets.smoothed_rtt(),
            self.clock.approximate_now(),
        );
        if decision == AckDecision::AckNow && !self.flusher_attached {
            self.alarms
                .update(AlarmKind::Ack, self.clock.approximate_now(), ALARM_GRANULARITY);
        }
    }
}
