use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::protocol::message_id::RAKNET_PROTOCOL_VERSION;

/// The lowest MTU RakNet peers are expected to support
pub const MINIMUM_MTU: u16 = 400;
/// Ethernet's MTU. Bigger datagrams would be fragmented at the IP level.
pub const MAXIMUM_MTU: u16 = 1500;

/// Configuration shared by an end point and all of its peer sessions.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The address the end point's UDP socket binds to
    pub bind_addr: SocketAddr,

    /// This end point's globally unique identifier, sent to peers during the handshake. It is
    ///  initialized randomly.
    pub guid: u64,

    /// The status string returned to unconnected pings. Applications on top of RakNet (e.g.
    ///  Minecraft) define their own format for this.
    pub identifier: String,

    pub protocol_version: u8,

    /// Incoming connection attempts are rejected if this is false
    pub accept_incoming: bool,
    pub max_connections: usize,

    /// The MTU used for peers registered without a negotiated MTU. The MTU is the size of an IP
    ///  packet, i.e. it includes IP and UDP headers.
    pub mtu: u16,
    /// Lower bound for MTU negotiation.
    pub min_mtu: u16,
    /// Upper bound for MTU negotiation. Clients offering a bigger MTU are told to use this.
    pub max_mtu: u16,

    /// The number of order channels, at most 32
    pub order_channels: u8,

    /// Upper bound for the number of fragments a received split message can have. Split messages
    ///  announcing more fragments are treated as malformed.
    pub max_split_count: u32,
    /// The number of split messages that can be reassembled concurrently per peer. If this limit
    ///  is exceeded, unreliable assemblies are discarded to make room. A reliable fragment that
    ///  still finds no room is not acknowledged, so the peer resends it later.
    pub max_split_assemblies: usize,
    /// Upper bound for the number of fragments an outgoing message is split into. This determines
    ///  the biggest message that can be sent.
    pub max_fragments_per_send: u32,

    /// The number of sequence numbers / message indices tracked for duplicate detection. Reliable
    ///  messages further ahead of the oldest missing message index are not acknowledged until
    ///  the gap is filled.
    pub received_window_size: u32,
    /// The number of order indices an ordered message may be ahead of the next expected index
    ///  and still be buffered. Messages further ahead are not acknowledged until the channel
    ///  catches up.
    pub ordering_window_size: u32,

    /// A session is closed if nothing was received from the peer for this long
    pub session_timeout: Duration,
    /// The interval for sending pings to measure latency (if `latency_enabled`)
    pub ping_interval: Duration,
    pub latency_enabled: bool,
    /// If nothing was received for this long, a keep-alive probe is sent to the peer
    pub keep_alive_interval: Duration,

    /// Retransmission timeout before the first RTT sample is available
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// The interval at which the end point drives its sessions' timers
    pub tick_interval: Duration,
    /// Upper bound for the number of datagrams a session emits per flush
    pub max_datagrams_per_tick: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19132)),
            guid: rand::random(),
            identifier: String::new(),
            protocol_version: RAKNET_PROTOCOL_VERSION,
            accept_incoming: true,
            max_connections: 64,
            mtu: 1464,
            min_mtu: MINIMUM_MTU,
            max_mtu: 1492,
            order_channels: 32,
            max_split_count: 128,
            max_split_assemblies: 64,
            max_fragments_per_send: 128,
            received_window_size: 2048,
            ordering_window_size: 2048,
            session_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_millis(2500),
            latency_enabled: true,
            keep_alive_interval: Duration::from_secs(5),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(10),
            tick_interval: Duration::from_millis(10),
            max_datagrams_per_tick: 256,
        }
    }
}

impl TransportConfig {
    pub fn new(bind_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_mtu < MINIMUM_MTU {
            bail!("minimum MTU must be at least {}", MINIMUM_MTU);
        }
        if self.max_mtu > MAXIMUM_MTU {
            bail!("maximum MTU must be at most {}", MAXIMUM_MTU);
        }
        if self.mtu < self.min_mtu || self.mtu > self.max_mtu {
            bail!("MTU {} is outside the configured range {}..={}", self.mtu, self.min_mtu, self.max_mtu);
        }
        if self.order_channels == 0 || self.order_channels > 32 {
            bail!("the number of order channels must be between 1 and 32");
        }
        if self.max_split_count == 0 || self.max_fragments_per_send == 0 {
            bail!("split limits must be positive");
        }
        if self.max_split_assemblies == 0 {
            bail!("at least one split assembly is required");
        }
        if self.received_window_size == 0 || self.ordering_window_size == 0 {
            bail!("window sizes must be positive");
        }
        if self.received_window_size >= 1 << 23 || self.ordering_window_size >= 1 << 23 {
            bail!("window sizes must be less than half the index range");
        }
        if self.ping_interval >= self.session_timeout {
            bail!("ping interval must be shorter than the session timeout");
        }
        if self.min_rto > self.max_rto {
            bail!("minimum RTO must not exceed the maximum RTO");
        }
        if self.max_datagrams_per_tick == 0 {
            bail!("at least one datagram per tick is required");
        }
        if self.identifier.len() > u16::MAX as usize {
            bail!("identifier is too long");
        }
        Ok(())
    }
}
