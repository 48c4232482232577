use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::ack::Acknowledgement;
use crate::config::TransportConfig;
use crate::datagram::CustomDatagram;
use crate::engine::{ReceiptEvent, ReceivedMessage, ReliabilityEngine};
use crate::error::{SendError, WireError, WireResult};
use crate::protocol::message_id::*;
use crate::protocol::ProtocolMessage;
use crate::reliability::Reliability;
use crate::rtt::LatencyStats;

/// upper bound for the number of pings we keep track of while waiting for the matching pong
const MAX_OUTSTANDING_PINGS: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// the login exchange is in progress. Application messages are not sent, and received ones
    ///  are held back until the login completes.
    Handshaking,
    Connected,
    /// a disconnect was requested or forced, the final datagrams are waiting to be flushed
    Disconnecting,
    Disconnected,
}

/// The role of the local side in the connection's login exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerRole {
    /// we initiated the connection and send the connection request
    Client,
    /// the peer initiated the connection
    Server,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// nothing was received from the peer within the session timeout
    Timeout,
    LocalDisconnect,
    PeerDisconnected,
    ConnectionClosed(String),
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Timeout => write!(f, "session timed out"),
            DisconnectReason::LocalDisconnect => write!(f, "disconnected locally"),
            DisconnectReason::PeerDisconnected => write!(f, "disconnected by peer"),
            DisconnectReason::ConnectionClosed(msg) => write!(f, "connection closed: {}", msg),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// An application message. The payload starts with the message's id byte.
    Message { channel: u8, payload: Bytes },
    AckReceipt(u32),
    AckReceiptLoss(u32),
    Disconnected(DisconnectReason),
}

#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub duplicate_datagrams: u64,
    pub deferred_datagrams: u64,
    pub messages_resent: u64,
    pub messages_delivered: u64,
    pub malformed_datagrams: u64,
    pub malformed_messages: u64,
    pub latency: LatencyStats,
    pub rto: Duration,
    pub srtt: Option<Duration>,
}

/// The state of a connection to a single peer.
///
/// A session is a pure state machine: it is fed received packets and the passage of time, and
///  it produces packets to send and events for the application. It never does I/O, and it is
///  not thread safe - callers serialize access to a session.
///
/// Control messages (pings, login exchange, disconnect notification) are handled by the session
///  and never reach the application.
pub struct PeerSession {
    config: Arc<TransportConfig>,
    role: PeerRole,
    remote_addr: SocketAddr,
    remote_guid: u64,
    state: SessionState,
    /// the reason reported when the session goes from `Disconnecting` to `Disconnected`
    pending_close: Option<DisconnectReason>,

    engine: ReliabilityEngine,
    events: VecDeque<SessionEvent>,
    /// application messages that overtook the end of the login exchange
    early_messages: Vec<SessionEvent>,

    /// reference point for the millisecond timestamps in pings and login messages
    created_at: Instant,
    last_received: Instant,
    last_ping_sent: Option<Instant>,
    last_keep_alive_sent: Option<Instant>,
    outstanding_pings: VecDeque<i64>,
    latency: LatencyStats,
    malformed_datagrams: u64,
}

impl PeerSession {
    pub fn new(config: Arc<TransportConfig>, role: PeerRole, remote_addr: SocketAddr, remote_guid: u64, mtu: u16, now: Instant) -> PeerSession {
        debug!("creating {:?} session for {:?} with MTU {}", role, remote_addr, mtu);

        let engine = ReliabilityEngine::new(&config, mtu);
        PeerSession {
            config,
            role,
            remote_addr,
            remote_guid,
            state: SessionState::Handshaking,
            pending_close: None,
            engine,
            events: Default::default(),
            early_messages: Vec::new(),
            created_at: now,
            last_received: now,
            last_ping_sent: None,
            last_keep_alive_sent: None,
            outstanding_pings: Default::default(),
            latency: Default::default(),
            malformed_datagrams: 0,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_guid(&self) -> u64 {
        self.remote_guid
    }

    pub fn mtu(&self) -> u16 {
        self.engine.mtu()
    }

    pub fn latency(&self) -> &LatencyStats {
        &self.latency
    }

    pub fn stats(&self) -> SessionStats {
        let engine_stats = self.engine.stats();
        SessionStats {
            datagrams_sent: engine_stats.datagrams_sent,
            datagrams_received: engine_stats.datagrams_received,
            duplicate_datagrams: engine_stats.duplicate_datagrams,
            deferred_datagrams: engine_stats.deferred_datagrams,
            messages_resent: engine_stats.messages_resent,
            messages_delivered: engine_stats.messages_delivered,
            malformed_datagrams: self.malformed_datagrams,
            malformed_messages: engine_stats.malformed_messages,
            latency: self.latency.clone(),
            rto: self.engine.rto(),
            srtt: self.engine.srtt(),
        }
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Starts the login exchange by sending a connection request. This is for client sessions
    ///  only; server sessions wait for the peer's request.
    pub fn begin_login(&mut self, now: Instant) {
        if self.role != PeerRole::Client || self.state != SessionState::Handshaking {
            debug!("ignoring login request for {:?} in state {:?}", self.remote_addr, self.state);
            return;
        }

        let request = ProtocolMessage::ConnectionRequest {
            client_guid: self.config.guid,
            timestamp: self.timestamp(now),
            use_security: false,
        };
        self.send_control(Reliability::ReliableOrdered, &request);
    }

    /// Completes the login exchange, for callers that do their own login handling
    pub fn mark_connected(&mut self) {
        if self.state == SessionState::Handshaking {
            info!("connection to {:?} established", self.remote_addr);
            self.state = SessionState::Connected;
            self.events.push_back(SessionEvent::Connected);
            self.events.extend(self.early_messages.drain(..));
        }
    }

    /// Queues an application message. The payload is expected to start with the message's id
    ///  byte, which should be at least `ID_USER_PACKET_ENUM`.
    pub fn send(&mut self, reliability: Reliability, channel: u8, payload: Bytes) -> Result<Option<u32>, SendError> {
        if self.state != SessionState::Connected {
            return Err(SendError::NotConnected);
        }
        self.engine.send(reliability, channel, payload)
    }

    /// Processes a packet received from the peer. Failure to decode the packet drops it but
    ///  leaves the session intact.
    pub fn on_datagram(&mut self, now: Instant, packet: Bytes) -> WireResult<()> {
        if self.state == SessionState::Disconnected {
            trace!("session for {:?} is closed, dropping packet", self.remote_addr);
            return Ok(());
        }

        let result = self.on_packet(now, packet);
        if let Err(e) = &result {
            warn!("dropping malformed packet from {:?}: {}", self.remote_addr, e);
            self.malformed_datagrams += 1;
        }
        result
    }

    fn on_packet(&mut self, now: Instant, mut packet: Bytes) -> WireResult<()> {
        let Some(&id) = packet.first() else {
            return Err(WireError::BufferUnderrun { needed: 1, remaining: 0 });
        };

        if CustomDatagram::is_datagram_id(id) {
            let datagram = CustomDatagram::deser(&mut packet)?;
            self.last_received = now;
            trace!("received datagram #{} from {:?}", datagram.sequence_number, self.remote_addr);

            for message in self.engine.on_datagram(datagram) {
                self.on_message(now, message);
            }
            Ok(())
        }
        else if Acknowledgement::kind_for_id(id).is_some() {
            let ack = Acknowledgement::deser(&mut packet)?;
            self.last_received = now;

            let receipts = self.engine.on_acknowledgement(now, ack);
            self.on_receipts(receipts);
            Ok(())
        }
        else {
            Err(WireError::UnknownMessageId(id))
        }
    }

    fn on_message(&mut self, now: Instant, message: ReceivedMessage) {
        let Some(&id) = message.payload.first() else {
            debug!("dropping empty message from {:?}", self.remote_addr);
            return;
        };

        if is_control_message_id(id) {
            match ProtocolMessage::deser(&mut message.payload.clone()) {
                Ok(msg) => self.on_control_message(now, msg),
                Err(e) => {
                    warn!("dropping malformed control message {:#04x} from {:?}: {}", id, self.remote_addr, e);
                    self.malformed_datagrams += 1;
                }
            }
            return;
        }

        let event = SessionEvent::Message {
            channel: message.channel,
            payload: message.payload,
        };
        match self.state {
            SessionState::Connected => self.events.push_back(event),
            SessionState::Handshaking => {
                trace!("holding back message {:#04x} from {:?} until the login completes", id, self.remote_addr);
                self.early_messages.push(event);
            }
            _ => debug!("dropping message {:#04x} from {:?} in state {:?}", id, self.remote_addr, self.state),
        }
    }

    fn on_control_message(&mut self, now: Instant, msg: ProtocolMessage) {
        trace!("received {:?} from {:?}", msg, self.remote_addr);

        match msg {
            ProtocolMessage::ConnectedPing { timestamp } => {
                let pong = ProtocolMessage::ConnectedPong {
                    ping_timestamp: timestamp,
                    pong_timestamp: self.timestamp(now),
                };
                self.send_control(Reliability::Unreliable, &pong);
            }
            ProtocolMessage::ConnectedPong { ping_timestamp, .. } => {
                self.on_pong(now, ping_timestamp);
            }
            ProtocolMessage::DetectLostConnections => {
                self.send_ping(now);
            }
            ProtocolMessage::ConnectionRequest { timestamp, use_security, .. } => {
                self.on_connection_request(now, timestamp, use_security);
            }
            ProtocolMessage::ConnectionRequestAccepted { accepted_timestamp, .. } => {
                if self.role != PeerRole::Client || self.state != SessionState::Handshaking {
                    debug!("ignoring unexpected connection acceptance from {:?}", self.remote_addr);
                    return;
                }
                let reply = ProtocolMessage::NewIncomingConnection {
                    server_address: self.remote_addr,
                    server_timestamp: accepted_timestamp,
                    client_timestamp: self.timestamp(now),
                };
                self.send_control(Reliability::ReliableOrdered, &reply);
                self.mark_connected();
            }
            ProtocolMessage::NewIncomingConnection { .. } => {
                if self.role == PeerRole::Server {
                    self.mark_connected();
                }
            }
            ProtocolMessage::ConnectionAttemptFailed => {
                if self.state == SessionState::Handshaking {
                    self.close(DisconnectReason::ConnectionClosed("connection attempt failed".to_string()));
                }
            }
            ProtocolMessage::DisconnectionNotification | ProtocolMessage::ConnectionLost => {
                self.close(DisconnectReason::PeerDisconnected);
            }
            other => {
                debug!("ignoring {:?} from {:?} inside a connection", other, self.remote_addr);
            }
        }
    }

    fn on_connection_request(&mut self, now: Instant, request_timestamp: i64, use_security: bool) {
        if self.role != PeerRole::Server || self.state != SessionState::Handshaking {
            debug!("ignoring unexpected connection request from {:?}", self.remote_addr);
            return;
        }

        if use_security {
            info!("{:?} requested a secure connection, which is not supported - rejecting", self.remote_addr);
            self.send_control(Reliability::ReliableOrdered, &ProtocolMessage::ConnectionAttemptFailed);
            self.state = SessionState::Disconnecting;
            self.pending_close = Some(DisconnectReason::ConnectionClosed("peer requested security".to_string()));
            return;
        }

        let accepted = ProtocolMessage::ConnectionRequestAccepted {
            client_address: self.remote_addr,
            system_index: 0,
            request_timestamp,
            accepted_timestamp: self.timestamp(now),
        };
        self.send_control(Reliability::ReliableOrdered, &accepted);
    }

    fn on_pong(&mut self, now: Instant, ping_timestamp: i64) {
        let Some(pos) = self.outstanding_pings.iter().position(|&t| t == ping_timestamp) else {
            debug!("received pong from {:?} for unknown ping @{}", self.remote_addr, ping_timestamp);
            return;
        };
        self.outstanding_pings.remove(pos);

        let millis = self.timestamp(now).saturating_sub(ping_timestamp).max(0);
        let latency = Duration::from_millis(millis as u64);
        trace!("latency to {:?}: {:?}", self.remote_addr, latency);
        self.latency.record(latency);
    }

    fn on_receipts(&mut self, receipts: Vec<ReceiptEvent>) {
        for receipt in receipts {
            self.events.push_back(match receipt {
                ReceiptEvent::Acked(id) => SessionEvent::AckReceipt(id),
                ReceiptEvent::Lost(id) => SessionEvent::AckReceiptLoss(id),
            });
        }
    }

    /// Drives the session's timers: session timeout, retransmission timeout, pings and
    ///  keep-alive probes
    pub fn on_tick(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }

        if now.saturating_duration_since(self.last_received) >= self.config.session_timeout {
            info!("nothing received from {:?} for {:?}, closing session", self.remote_addr, self.config.session_timeout);
            self.close(DisconnectReason::Timeout);
            return;
        }

        let receipts = self.engine.on_tick(now);
        self.on_receipts(receipts);

        if self.state != SessionState::Connected {
            return;
        }

        if self.config.latency_enabled && self.last_ping_sent.map_or(true, |t| now.saturating_duration_since(t) >= self.config.ping_interval) {
            self.send_ping(now);
        }

        let keep_alive_interval = self.config.keep_alive_interval;
        if now.saturating_duration_since(self.last_received) >= keep_alive_interval
            && self.last_keep_alive_sent.map_or(true, |t| now.saturating_duration_since(t) >= keep_alive_interval)
        {
            debug!("nothing received from {:?} for {:?}, probing", self.remote_addr, keep_alive_interval);
            self.last_keep_alive_sent = Some(now);
            self.send_control(Reliability::Unreliable, &ProtocolMessage::DetectLostConnections);
        }
    }

    /// Returns the packets that are ready to be sent to the peer
    pub fn flush_outgoing(&mut self, now: Instant) -> Vec<Bytes> {
        if self.state == SessionState::Disconnected {
            return vec![];
        }

        let result = self.engine.flush_outgoing(now, self.config.max_datagrams_per_tick);

        if self.state == SessionState::Disconnecting {
            let reason = self.pending_close.take()
                .unwrap_or(DisconnectReason::LocalDisconnect);
            self.close(reason);
        }
        result
    }

    /// Starts a graceful disconnect: everything that is not sent yet is discarded, and the next
    ///  flush sends a disconnection notification and closes the session.
    pub fn disconnect(&mut self) {
        if matches!(self.state, SessionState::Disconnecting | SessionState::Disconnected) {
            return;
        }

        debug!("disconnecting from {:?}", self.remote_addr);
        self.engine.clear_send_queue();
        self.send_control(Reliability::Unreliable, &ProtocolMessage::DisconnectionNotification);
        self.state = SessionState::Disconnecting;
        self.pending_close = Some(DisconnectReason::LocalDisconnect);
    }

    fn close(&mut self, reason: DisconnectReason) {
        if self.state == SessionState::Disconnected {
            return;
        }
        info!("session with {:?} closed: {}", self.remote_addr, reason);
        self.engine.clear_send_queue();
        self.early_messages.clear();
        self.state = SessionState::Disconnected;
        self.events.push_back(SessionEvent::Disconnected(reason));
    }

    fn send_ping(&mut self, now: Instant) {
        let timestamp = self.timestamp(now);
        self.last_ping_sent = Some(now);
        self.outstanding_pings.push_back(timestamp);
        if self.outstanding_pings.len() > MAX_OUTSTANDING_PINGS {
            self.outstanding_pings.pop_front();
        }
        self.send_control(Reliability::Unreliable, &ProtocolMessage::ConnectedPing { timestamp });
    }

    fn send_control(&mut self, reliability: Reliability, msg: &ProtocolMessage) {
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {:?} for {:?}: {}", msg, self.remote_addr, e);
                return;
            }
        };
        if let Err(e) = self.engine.send(reliability, 0, payload) {
            warn!("failed to send {:?} to {:?}: {}", msg, self.remote_addr, e);
        }
    }

    fn timestamp(&self, now: Instant) -> i64 {
        let millis = now.saturating_duration_since(self.created_at).as_millis();
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}

/// ids of messages that are consumed by the session rather than delivered to the application
fn is_control_message_id(id: u8) -> bool {
    matches!(id,
        ID_CONNECTED_PING | ID_CONNECTED_PONG | ID_DETECT_LOST_CONNECTIONS
        | ID_CONNECTION_REQUEST | ID_CONNECTION_REQUEST_ACCEPTED | ID_CONNECTION_ATTEMPT_FAILED
        | ID_NEW_INCOMING_CONNECTION | ID_DISCONNECTION_NOTIFICATION | ID_CONNECTION_LOST)
}
