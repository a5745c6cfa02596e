//! # Ack Queuing Policy
//!
//! Decides *when* to acknowledge received packets; the received-packet
//! manager decides *what* the ack frame contains. One state block per packet
//! number space (all three collapse onto the Application entry when the
//! connection runs a single space).
//!
//! Three modes: classic TCP-style acking (every other retransmittable
//! packet), ack decimation (every tenth, or after a fraction of RTT), and
//! decimation with reordering tolerance (delays the out-of-order ack by
//! RTT/8 instead of acking immediately).

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::config::{ConnectionConfig, ConnectionOption};
use crate::types::{
    Instant, PacketNumber, PacketNumberSpace, NUM_PACKET_NUMBER_SPACES,
};

// ============================================================================
// Policy Constants
// ============================================================================

/// Ack every other retransmittable packet before decimation kicks in.
pub const RETRANSMITTABLE_BEFORE_ACK_DEFAULT: u64 = 2;

/// Received packets before decimation starts; avoids starving the peer's
/// congestion window during early slow start.
pub const MIN_RECEIVED_BEFORE_ACK_DECIMATION: u64 = 100;

/// Wait for at most this many retransmittable packets while decimating.
pub const MAX_RETRANSMITTABLE_BEFORE_ACK: u64 = 10;

/// One quarter RTT delay when decimating.
pub const ACK_DECIMATION_DELAY: f32 = 0.25;

/// One eighth RTT delay when decimating with the short delay option.
pub const SHORT_ACK_DECIMATION_DELAY: f32 = 0.125;

/// Default bound on how long an ack may be delayed.
pub const DELAYED_ACK_TIME: Duration = Duration::from_millis(25);

/// Delay used instead after a quiescent gap longer than the smoothed RTT.
const FAST_ACK_DELAY: Duration = Duration::from_millis(1);

// ============================================================================
// Modes and State
// ============================================================================

/// When to send acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack every `retransmittable_before_ack` retransmittable packets.
    TcpAcking,
    /// Ack every tenth retransmittable packet or after a fraction of RTT.
    AckDecimation,
    /// Decimation that tolerates reordering: a new gap schedules a short
    /// timer instead of acking immediately.
    AckDecimationWithReordering,
}

/// What the connection should do after feeding a received packet in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Nothing to do now; a timer may be pending.
    None,
    /// An ack is queued: flush it with the active flusher, or fire the ack
    /// alarm immediately.
    AckNow,
}

/// Per-space ack bookkeeping.
#[derive(Debug, Clone, Default)]
struct AckState {
    retransmittable_since_last_ack: u64,
    packets_since_last_ack: u64,
    /// Largest packet number this endpoint has acknowledged in a sent ack.
    largest_acked_by_us: Option<PacketNumber>,
    /// Largest received packet that itself carried an ack frame.
    largest_received_with_ack: Option<PacketNumber>,
    /// Largest received packet that carried a stop-waiting frame.
    largest_received_with_stop_waiting: Option<PacketNumber>,
    time_of_previous_received_packet: Option<Instant>,
    ack_deadline: Option<Instant>,
    ack_queued: bool,
}

/// The ack controller: policy state for every packet number space.
#[derive(Debug, Clone)]
pub struct AckController {
    mode: AckMode,
    decimation_delay: f32,
    unlimited_decimation: bool,
    fast_ack_after_quiescence: bool,
    delayed_ack_time: Duration,
    min_received_before_decimation: u64,
    retransmittable_before_ack: u64,
    num_spaces: usize,
    states: [AckState; NUM_PACKET_NUMBER_SPACES],
    /// Consecutive acks sent with a new largest-acked; drives legacy
    /// stop-waiting emission.
    stop_waiting_count: u64,
}

impl AckController {
    pub fn new(num_spaces: usize) -> Self {
        debug_assert!(num_spaces == 1 || num_spaces == NUM_PACKET_NUMBER_SPACES);
        Self {
            mode: AckMode::TcpAcking,
            decimation_delay: ACK_DECIMATION_DELAY,
            unlimited_decimation: false,
            fast_ack_after_quiescence: false,
            delayed_ack_time: DELAYED_ACK_TIME,
            min_received_before_decimation: MIN_RECEIVED_BEFORE_ACK_DECIMATION,
            retransmittable_before_ack: RETRANSMITTABLE_BEFORE_ACK_DEFAULT,
            num_spaces,
            states: Default::default(),
            stop_waiting_count: 0,
        }
    }

    /// Apply negotiated connection options. Called once from
    /// `set_from_config`.
    pub fn configure(&mut self, config: &ConnectionConfig) {
        if config.has_option(ConnectionOption::ACKD) {
            self.mode = AckMode::AckDecimation;
        }
        if config.has_option(ConnectionOption::AKD2) {
            self.mode = AckMode::AckDecimationWithReordering;
        }
        if config.has_option(ConnectionOption::AKD3) {
            self.mode = AckMode::AckDecimation;
            self.decimation_delay = SHORT_ACK_DECIMATION_DELAY;
        }
        if config.has_option(ConnectionOption::AKD4) {
            self.mode = AckMode::AckDecimationWithReordering;
            self.decimation_delay = SHORT_ACK_DECIMATION_DELAY;
        }
        if config.has_option(ConnectionOption::AKDU) {
            self.unlimited_decimation = true;
        }
        if config.has_option(ConnectionOption::ACD0) {
            self.mode = AckMode::TcpAcking;
        }
        if config.has_option(ConnectionOption::ACKQ) {
            self.fast_ack_after_quiescence = true;
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AckMode) {
        self.mode = mode;
    }

    pub fn set_min_received_before_decimation(&mut self, count: u64) {
        self.min_received_before_decimation = count;
    }

    fn state(&self, space: PacketNumberSpace) -> &AckState {
        &self.states[self.slot(space)]
    }

    fn state_mut(&mut self, space: PacketNumberSpace) -> &mut AckState {
        let slot = self.slot(space);
        &mut self.states[slot]
    }

    fn slot(&self, space: PacketNumberSpace) -> usize {
        if self.num_spaces == 1 {
            PacketNumberSpace::Application.index()
        } else {
            space.index()
        }
    }

    // ------------------------------------------------------------------
    // Receipt policy
    // ------------------------------------------------------------------

    /// Feed one completed incoming packet into the policy.
    ///
    /// `was_missing` is true when this packet filled a gap below the
    /// largest already received. `rtt` is the current smoothed RTT.
    #[allow(clippy::too_many_arguments)]
    pub fn on_packet_received(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
        receipt_time: Instant,
        should_instigate_ack: bool,
        was_missing: bool,
        peer_first_sending_packet_number: PacketNumber,
        has_new_missing_packets: bool,
        rtt: Duration,
        now: Instant,
    ) -> AckDecision {
        let mode = self.mode;
        let decimation_delay = self.decimation_delay;
        let unlimited = self.unlimited_decimation;
        let fast_after_quiescence = self.fast_ack_after_quiescence;
        let delayed_ack_time = self.delayed_ack_time;
        let min_before_decimation = self.min_received_before_decimation;
        let before_ack = self.retransmittable_before_ack;

        let st = self.state_mut(space);
        st.packets_since_last_ack += 1;

        // A gap-filler below a packet we already acked: the peer believes it
        // lost; correct the record immediately.
        if was_missing && st.largest_acked_by_us.map_or(false, |acked| acked > packet_number) {
            st.ack_queued = true;
        }

        if should_instigate_ack {
            st.retransmittable_since_last_ack += 1;

            let quiescent = fast_after_quiescence
                && st
                    .time_of_previous_received_packet
                    .map_or(false, |prev| receipt_time.saturating_duration_since(prev) > rtt);

            if mode != AckMode::TcpAcking
                && packet_number
                    >= peer_first_sending_packet_number.saturating_add(min_before_decimation)
            {
                if !unlimited
                    && st.retransmittable_since_last_ack >= MAX_RETRANSMITTABLE_BEFORE_ACK
                {
                    st.ack_queued = true;
                } else if st.ack_deadline.is_none() {
                    let delay = if quiescent {
                        FAST_ACK_DELAY
                    } else {
                        delayed_ack_time.min(rtt.mul_f32(decimation_delay))
                    };
                    st.ack_deadline = Some(now + delay);
                }
            } else if st.retransmittable_since_last_ack >= before_ack {
                st.ack_queued = true;
            } else if st.ack_deadline.is_none() {
                let delay = if quiescent { FAST_ACK_DELAY } else { delayed_ack_time };
                st.ack_deadline = Some(now + delay);
            }

            st.time_of_previous_received_packet = Some(receipt_time);
        }

        if has_new_missing_packets {
            if mode == AckMode::AckDecimationWithReordering {
                let reorder_deadline = now + rtt.mul_f32(SHORT_ACK_DECIMATION_DELAY);
                st.ack_deadline = Some(match st.ack_deadline {
                    Some(existing) => existing.min(reorder_deadline),
                    None => reorder_deadline,
                });
            } else {
                st.ack_queued = true;
            }
        }

        if st.ack_queued {
            st.ack_deadline = None;
            AckDecision::AckNow
        } else {
            AckDecision::None
        }
    }

    // ------------------------------------------------------------------
    // Queued/deadline accessors
    // ------------------------------------------------------------------

    pub fn ack_queued(&self, space: PacketNumberSpace) -> bool {
        self.state(space).ack_queued
    }

    /// Force an ack to be bundled with the next flush.
    pub fn queue_ack(&mut self, space: PacketNumberSpace) {
        self.state_mut(space).ack_queued = true;
        self.state_mut(space).ack_deadline = None;
    }

    pub fn ack_deadline(&self, space: PacketNumberSpace) -> Option<Instant> {
        self.state(space).ack_deadline
    }

    /// Earliest pending deadline across all spaces, for the ack alarm.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for st in &self.states[..] {
            if let Some(d) = st.ack_deadline {
                earliest = Some(earliest.map_or(d, |e| e.min(d)));
            }
        }
        earliest
    }

    /// Whether any space has an ack queued or a deadline that has elapsed.
    pub fn ack_due(&self, space: PacketNumberSpace, now: Instant) -> bool {
        let st = self.state(space);
        st.ack_queued || st.ack_deadline.map_or(false, |d| d <= now)
    }

    /// Spaces with work pending, used by multi-space ack flushing.
    pub fn spaces(&self) -> impl Iterator<Item = PacketNumberSpace> {
        let single = self.num_spaces == 1;
        PacketNumberSpace::ALL
            .into_iter()
            .filter(move |s| !single || *s == PacketNumberSpace::Application)
    }

    // ------------------------------------------------------------------
    // Ack emission bookkeeping
    // ------------------------------------------------------------------

    /// Reset counters after an ack for `space` left through the builder.
    pub fn on_ack_sent(&mut self, space: PacketNumberSpace, largest_acked: PacketNumber) {
        self.stop_waiting_count = 0;
        let st = self.state_mut(space);
        st.retransmittable_since_last_ack = 0;
        st.packets_since_last_ack = 0;
        st.ack_queued = false;
        st.ack_deadline = None;
        if st.largest_acked_by_us.map_or(true, |l| largest_acked > l) {
            st.largest_acked_by_us = Some(largest_acked);
        }
    }

    /// Record that an incoming packet carried an ack frame.
    pub fn set_largest_received_with_ack(&mut self, space: PacketNumberSpace, packet_number: PacketNumber) {
        self.state_mut(space).largest_received_with_ack = Some(packet_number);
    }

    pub fn largest_received_with_ack(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        self.state(space).largest_received_with_ack
    }

    /// Record that an incoming packet carried a stop-waiting frame.
    pub fn set_largest_received_with_stop_waiting(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
    ) {
        self.state_mut(space).largest_received_with_stop_waiting = Some(packet_number);
    }

    pub fn largest_received_with_stop_waiting(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        self.state(space).largest_received_with_stop_waiting
    }

    /// Bump the consecutive new-largest-acked counter; returns the new
    /// count. Two in a row triggers a stop-waiting frame.
    pub fn on_ack_with_new_largest(&mut self) -> u64 {
        self.stop_waiting_count += 1;
        self.stop_waiting_count
    }

    pub fn reset_stop_waiting_count(&mut self) {
        self.stop_waiting_count = 0;
    }

    pub fn stop_waiting_count(&self) -> u64 {
        self.stop_waiting_count
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
