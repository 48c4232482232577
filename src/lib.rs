//! This crate implements the transport layer of RakNet, a connection-oriented protocol on top of
//!  UDP that is used by games like Minecraft Bedrock Edition. It provides reliable and / or
//!  ordered delivery of messages of arbitrary size, configurable per message.
//!
//! The core of the implementation is sans-IO: [session::PeerSession] and
//!  [engine::ReliabilityEngine] process packets and timer ticks with an explicitly passed-in
//!  'now', and they produce packets to send and events for the application. [end_point::EndPoint]
//!  wires this up with a tokio UDP socket.
//!
//! ## Wire format
//!
//! All multi-byte numbers are big-endian, except for 24-bit 'triads' which are little-endian.
//!  The first byte of each UDP packet identifies its kind:
//!
//! ```ascii
//! 0x80..=0x8f  data datagram: triad sequence number, followed by encapsulated messages
//! 0xc0         ACK: list of sequence numbers and ranges the peer received
//! 0xa0         NACK: list of sequence numbers and ranges the peer is missing
//! other        offline message (unconnected ping / pong, open connection handshake)
//! ```
//!
//! An encapsulated message has the following header:
//!
//! ```ascii
//! 0:  flags: reliability (bits 5-7), split (bit 4)
//! 1:  payload length in *bits* (u16)
//! 3:  message index (triad) - only for reliable kinds
//!  *  order index (triad) and order channel (u8) - only for ordered and sequenced kinds
//!  *  split count (u32), split id (u16), split index (u32) - only for split messages
//!  *  payload
//! ```
//!
//! ## Reliability
//!
//! * Every data datagram is acknowledged. Gaps in the received sequence numbers are reported
//!    with a NACK, causing the sender to resend immediately
//! * Datagrams that are neither ACKed nor NACKed are resent after a retransmission timeout
//!    which is calculated from round trip times (RFC 6298, with Karn's rule)
//! * Resent messages go into datagrams with fresh sequence numbers; duplicates are detected by
//!    message index on the receiving side
//! * Messages bigger than a datagram are split into fragments and reassembled by the receiver.
//!    All fragments of a message are sent reliably
//! * Ordered messages are buffered per order channel until all their predecessors arrived.
//!    Sequenced messages are delivered only if nothing newer was delivered before
//!
//! ## Sessions
//!
//! A session is created by the offline handshake (open connection request / reply, twice),
//!  after which the client sends a connection request that the server accepts. Sessions ping
//!  each other to measure latency, probe the peer if it was silent for a while, and close
//!  if nothing was received for the configured timeout.

pub mod ack;
pub mod batcher;
pub mod config;
pub mod datagram;
pub mod encapsulated;
pub mod end_point;
pub mod engine;
pub mod error;
pub mod message_dispatcher;
pub mod protocol;
pub mod reliability;
pub mod rtt;
pub mod safe_converter;
pub mod send_socket;
pub mod session;
pub mod wire;
