//! Exported per-connection counters.

#![forbid(unsafe_code)]

use crate::types::Instant;

/// Counters exported by the connection. All plain fields; cheap to copy out.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Packets handed to the writer.
    pub packets_sent: u64,
    /// Datagrams received from the peer.
    pub packets_received: u64,
    /// Packets fully processed (decrypted and dispatched).
    pub packets_processed: u64,
    /// Packets dropped before processing (not connected, duplicates, stale).
    pub packets_dropped: u64,
    /// Packets discarded at egress (closed, obsolete encryption).
    pub packets_discarded: u64,

    /// Bytes handed to the writer.
    pub bytes_sent: u64,
    /// Bytes received from the peer.
    pub bytes_received: u64,

    /// Packets reserialized by any retransmission path.
    pub packets_retransmitted: u64,

    /// Undecryptable packets dropped because the buffer was full or keys
    /// never arrived.
    pub undecryptable_packets_dropped: u64,

    /// Stateless reset packets accepted.
    pub stateless_resets_received: u64,

    /// MTU probes sent.
    pub mtu_probes_sent: u64,

    /// Connectivity probes received.
    pub probes_received: u64,

    /// Times the peer migrated its effective address.
    pub peer_migrations: u64,

    /// Invariant violations observed and survived (debug builds assert).
    pub bug_count: u64,

    /// When the connection was created, per the injected clock.
    pub connection_creation_time: Instant,
}
