//! # qconn-core: QUIC Connection State Machine
//!
//! This crate implements the CONNECTION CORE of a QUIC endpoint: the
//! per-connection state machine sitting between a raw datagram I/O surface
//! and a session layer. It accepts encrypted datagrams from a single peer,
//! drives the transport protocol, and produces encrypted datagrams to send
//! back.
//!
//! ## Architecture Overview
//!
//! ```text
//! qconn-core/
//! ├── error       - Transport error codes and wire mapping
//! ├── types       - Perspective, encryption levels, packet numbers, time
//! ├── frames      - Typed frames delivered by the framer callback surface
//! ├── alarm       - One-shot alarm multiplexing (ack, loss, ping, ...)
//! ├── interface   - Injected collaborators (writer, framer, builder, ...)
//! ├── config      - Connection configuration and option tags
//! ├── stats       - Exported per-connection counters
//! ├── ack         - Ack queuing policy (decimation, delayed ack timers)
//! ├── mtu         - Path MTU discovery schedule
//! ├── path        - Connectivity probes, address change classification
//! └── connection  - The connection actor itself
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure State Machine**: No sockets, no threads, no event loop. Time
//!    comes from an injected [`interface::Clock`], datagrams come in through
//!    [`connection::Connection::process_datagram`], and scheduled work runs
//!    when the driver calls [`connection::Connection::on_alarm`].
//!
//! 2. **Pluggable Collaborators**: Framing/crypto, loss detection,
//!    congestion control, received-packet bookkeeping, packet serialization,
//!    and the session above are all traits. The core owns the protocol
//!    decisions and defers the byte-exact work to its collaborators.
//!
//! 3. **Single-Threaded**: The connection assumes exclusive access by one
//!    driver. There is no internal locking; continuations are expressed as
//!    alarms.

#![forbid(unsafe_code)]

pub mod ack;
pub mod alarm;
pub mod config;
pub mod connection;
pub mod error;
pub mod frames;
pub mod interface;
pub mod mtu;
pub mod path;
pub mod stats;
pub mod types;

pub use ack::{AckDecision, AckMode};
pub use alarm::AlarmKind;
pub use config::{ConnectionConfig, ConnectionOption};
pub use connection::Connection;
pub use error::TransportError;
pub use frames::Frame;
pub use interface::{
    Clock, DebugVisitor, Framer, FramerVisitor, PacketBuilder, PacketSink, PacketWriter,
    ReceivedPacketManager, SentPacketManager, Visitor, WriteResult, WriterHandle,
};
pub use stats::ConnectionStats;
pub use types::{
    CloseBehavior, CloseSource, ConnectionId, EncryptionLevel, Instant, PacketNumber,
    PacketNumberSpace, Perspective, TransmissionType, Version,
};
