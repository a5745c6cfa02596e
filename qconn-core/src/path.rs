//! # Path Classification
//!
//! Two small pieces of path machinery: the per-packet content FSM that
//! recognizes connectivity probes, and the classification of peer address
//! changes that drives migration decisions.

#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};

use crate::frames::FrameKind;

// ============================================================================
// Packet Content FSM
// ============================================================================

/// Per-incoming-packet scratch state classifying the packet as a
/// connectivity probe.
///
/// Only the sequence "first frame PING (or PATH_CHALLENGE), then PADDING"
/// classifies a packet as a probe. Any other frame latches `NotPaddedPing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketContent {
    #[default]
    NoFramesReceived,
    FirstFrameIsPing,
    SecondFrameIsPadding,
    /// Latch: the packet is not a probe, whatever else arrives.
    NotPaddedPing,
}

impl PacketContent {
    /// Advance the FSM with the next frame of the packet.
    pub fn update(self, kind: FrameKind) -> PacketContent {
        match (self, kind) {
            (PacketContent::NoFramesReceived, FrameKind::Ping | FrameKind::PathChallenge) => {
                PacketContent::FirstFrameIsPing
            }
            (PacketContent::FirstFrameIsPing, FrameKind::Padding)
            | (PacketContent::SecondFrameIsPadding, FrameKind::Padding) => {
                PacketContent::SecondFrameIsPadding
            }
            _ => PacketContent::NotPaddedPing,
        }
    }

    /// Whether the completed packet classifies as a connectivity probe.
    pub fn is_connectivity_probe(self) -> bool {
        matches!(self, PacketContent::SecondFrameIsPadding)
    }
}

// ============================================================================
// Address Change Classification
// ============================================================================

/// Kind of peer address change observed between two packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChangeType {
    NoChange,
    /// Same IP, different port. Common under NAT rebinding.
    PortChange,
    /// IPv4 address moved within the same /24.
    Ipv4SubnetChange,
    Ipv4ToIpv6,
    Ipv6ToIpv4,
    /// Any other change.
    UnspecifiedChange,
}

impl AddressChangeType {
    /// Changes small enough that transport state (RTT, congestion window)
    /// plausibly still applies.
    pub fn is_minor(self) -> bool {
        matches!(
            self,
            AddressChangeType::NoChange
                | AddressChangeType::PortChange
                | AddressChangeType::Ipv4SubnetChange
        )
    }
}

/// Classify the transition from `old` to `new`.
pub fn address_change_type(old: SocketAddr, new: SocketAddr) -> AddressChangeType {
    if old == new {
        return AddressChangeType::NoChange;
    }
    if old.ip() == new.ip() {
        return AddressChangeType::PortChange;
    }
    match (old.ip(), new.ip()) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            if a.octets()[..3] == b.octets()[..3] {
                AddressChangeType::Ipv4SubnetChange
            } else {
                AddressChangeType::UnspecifiedChange
            }
        }
        (IpAddr::V4(_), IpAddr::V6(_)) => AddressChangeType::Ipv4ToIpv6,
        (IpAddr::V6(_), IpAddr::V4(_)) => AddressChangeType::Ipv6ToIpv4,
        (IpAddr::V6(_), IpAddr::V6(_)) => AddressChangeType::UnspecifiedChange,
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
