//! # Alarm Multiplexing
//!
//! The connection schedules all timer-driven work through a single table of
//! one-shot deadlines, one per [`AlarmKind`]. The driver asks
//! [`AlarmTable::next_deadline`] for the earliest pending deadline and calls
//! back into the connection when it elapses; the connection dispatches on the
//! expired kind. No per-alarm callback objects exist.

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::types::Instant;

/// Granularity used when re-arming an alarm whose deadline barely moved.
pub const ALARM_GRANULARITY: Duration = Duration::from_millis(1);

/// Every scheduled activity of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    /// Send a pending ack when the delayed-ack timer elapses
    Ack,
    /// Retransmission timeout from the sent-packet manager
    Retransmission,
    /// Writer became unblocked or pacing allows another send
    Send,
    /// Idle-network / handshake timeout check
    Timeout,
    /// Client keep-alive ping
    Ping,
    /// Send an MTU probe
    Mtu,
    /// Path degrading: no forward progress on the current path
    PathDegrading,
    /// Retry buffered undecryptable packets after new keys installed
    ProcessUndecryptable,
}

impl AlarmKind {
    const COUNT: usize = 8;

    /// All kinds, in dispatch order.
    pub const ALL: [AlarmKind; Self::COUNT] = [
        AlarmKind::Ack,
        AlarmKind::Retransmission,
        AlarmKind::Send,
        AlarmKind::Timeout,
        AlarmKind::Ping,
        AlarmKind::Mtu,
        AlarmKind::PathDegrading,
        AlarmKind::ProcessUndecryptable,
    ];

    fn index(self) -> usize {
        match self {
            AlarmKind::Ack => 0,
            AlarmKind::Retransmission => 1,
            AlarmKind::Send => 2,
            AlarmKind::Timeout => 3,
            AlarmKind::Ping => 4,
            AlarmKind::Mtu => 5,
            AlarmKind::PathDegrading => 6,
            AlarmKind::ProcessUndecryptable => 7,
        }
    }
}

/// Nearest pending deadline per alarm kind.
///
/// Deadlines are one-shot: expiring an alarm clears it, and the handler
/// re-arms if it wants to run again.
#[derive(Debug, Clone, Default)]
pub struct AlarmTable {
    deadlines: [Option<Instant>; AlarmKind::COUNT],
}

impl AlarmTable {
    /// Set the deadline unconditionally.
    pub fn set(&mut self, kind: AlarmKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
    }

    /// Re-arm only when the new deadline differs from the current one by
    /// more than `granularity` (or the alarm is unset). Avoids churning a
    /// deadline that barely moved.
    pub fn update(&mut self, kind: AlarmKind, deadline: Instant, granularity: Duration) {
        match self.deadlines[kind.index()] {
            Some(current) if current.abs_delta(deadline) <= granularity => {}
            _ => self.deadlines[kind.index()] = Some(deadline),
        }
    }

    /// Clear the deadline.
    pub fn cancel(&mut self, kind: AlarmKind) {
        self.deadlines[kind.index()] = None;
    }

    /// Current deadline, if armed.
    pub fn get(&self, kind: AlarmKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Whether the alarm is armed.
    pub fn is_set(&self, kind: AlarmKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// Earliest pending deadline across all kinds.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Pop one expired alarm at or before `now`, earliest first.
    ///
    /// Returns None when nothing is due. Handlers may re-arm the same kind;
    /// callers loop until exhaustion.
    pub fn expire_next(&mut self, now: Instant) -> Option<AlarmKind> {
        let mut due: Option<(Instant, AlarmKind)> = None;
        for kind in AlarmKind::ALL {
            if let Some(deadline) = self.deadlines[kind.index()] {
                if deadline <= now && due.map_or(true, |(t, _)| deadline < t) {
                    due = Some((deadline, kind));
                }
            }
        }
        let (_, kind) = due?;
        self.deadlines[kind.index()] = None;
        Some(kind)
    }

    /// Cancel everything. Used at teardown.
    pub fn cancel_all(&mut self) {
        self.deadlines = [None; AlarmKind::COUNT];
    }
}
