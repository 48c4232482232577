use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::message_dispatcher::MessageDispatcher;
use crate::protocol::ProtocolMessage;
use crate::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::session::{PeerRole, PeerSession, SessionEvent, SessionStats};

/// Big enough for any packet a peer may send: offline connection requests are padded to the
///  MTU the peer probes for, which may exceed what we are willing to negotiate.
const RECEIVE_BUFFER_LEN: usize = 2048;

type PeerMap = FxHashMap<SocketAddr, Arc<Mutex<PeerSession>>>;

/// EndPoint is the place where all other parts of the transport come together: It listens on a
///  UdpSocket, dispatching incoming packets to the peer sessions they belong to, answers offline
///  (i.e. connection-less) requests, drives the sessions' timers, and has an API for application
///  code to send messages.
///
/// Each session is guarded by its own lock, so packets for different peers are processed
///  independently. Events are dispatched to the application after the session's lock was
///  released.
pub struct EndPoint {
    config: Arc<TransportConfig>,
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    peers: RwLock<PeerMap>,
}

impl EndPoint {
    pub async fn new(config: TransportConfig, message_dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound socket to {:?}", receive_socket.local_addr()?);

        let send_socket = Arc::new(receive_socket.clone());
        Ok(Self::new_with_sockets(Arc::new(config), receive_socket, send_socket, message_dispatcher))
    }

    fn new_with_sockets(
        config: Arc<TransportConfig>,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> EndPoint {
        EndPoint {
            config,
            receive_socket,
            send_socket,
            message_dispatcher,
            peers: Default::default(),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().await
            .keys()
            .cloned()
            .collect()
    }

    pub async fn session_stats(&self, peer_addr: SocketAddr) -> Option<SessionStats> {
        let peer = self.peers.read().await
            .get(&peer_addr)
            .cloned()?;
        let session = peer.lock().await;
        Some(session.stats())
    }

    /// Creates a session for a peer whose offline handshake was done elsewhere. For
    ///  [PeerRole::Client], the login exchange is started right away.
    pub async fn register_peer(&self, peer_addr: SocketAddr, peer_guid: u64, mtu: u16, role: PeerRole) -> anyhow::Result<()> {
        if mtu < self.config.min_mtu || mtu > self.config.max_mtu {
            bail!("MTU {} for {:?} is outside the configured range {}..={}", mtu, peer_addr, self.config.min_mtu, self.config.max_mtu);
        }

        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer_addr) {
            bail!("there is a session for {:?} already", peer_addr);
        }

        let mut session = PeerSession::new(self.config.clone(), role, peer_addr, peer_guid, mtu, Instant::now());
        if role == PeerRole::Client {
            session.begin_login(Instant::now());
        }
        peers.insert(peer_addr, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Queues a message for a connected peer. It is sent with the next tick. The returned
    ///  receipt id is `Some` for reliabilities with ack receipt.
    pub async fn send(&self, peer_addr: SocketAddr, reliability: Reliability, channel: u8, message: Bytes) -> anyhow::Result<Option<u32>> {
        let peer = self.get_peer(peer_addr).await
            .ok_or_else(|| anyhow!("no session for {:?}", peer_addr))?;

        let mut session = peer.lock().await;
        trace!("queueing message of length {} for {:?} on channel {}", message.len(), peer_addr, channel);
        Ok(session.send(reliability, channel, message)?)
    }

    /// Sends a disconnection notification to a peer and removes its session
    pub async fn disconnect(&self, peer_addr: SocketAddr) -> anyhow::Result<()> {
        let peer = self.peers.write().await
            .remove(&peer_addr)
            .ok_or_else(|| anyhow!("no session for {:?}", peer_addr))?;

        let (packets, events) = {
            let mut session = peer.lock().await;
            session.disconnect();
            let packets = session.flush_outgoing(Instant::now());
            (packets, Self::drain_events(&mut session))
        };

        self.send_packets(peer_addr, packets).await;
        self.dispatch_events(peer_addr, events).await;
        Ok(())
    }

    /// Runs the receive loop and the tick loop until the surrounding task is cancelled
    pub async fn run(&self) {
        select! {
            _ = self.recv_loop() => {}
            _ = self.tick_loop() => {}
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?from, ?correlation_id);

            let packet = Bytes::copy_from_slice(&buf[..num_read]);
            self.on_packet(from, packet, Instant::now())
                .instrument(span)
                .await;
        }
    }

    pub async fn tick_loop(&self) {
        info!("starting tick loop with an interval of {:?}", self.config.tick_interval);

        let mut ticks = interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            self.on_tick(Instant::now()).await;
        }
    }

    async fn on_packet(&self, from: SocketAddr, packet: Bytes, now: Instant) {
        trace!("received packet from {:?}: {:?}", from, packet.as_ref());

        let Some(&id) = packet.first() else {
            debug!("empty packet from {:?} - dropping", from);
            return;
        };

        if ProtocolMessage::is_offline_id(id) {
            self.on_offline_packet(from, packet, now).await;
            return;
        }

        let Some(peer) = self.get_peer(from).await else {
            debug!("packet {:#04x} from {:?} without session - dropping", id, from);
            return;
        };

        let events = {
            let mut session = peer.lock().await;
            // malformed packets are logged and counted by the session
            let _ = session.on_datagram(now, packet);
            Self::drain_events(&mut session)
        };
        self.dispatch_events(from, events).await;
    }

    async fn on_offline_packet(&self, from: SocketAddr, packet: Bytes, now: Instant) {
        let msg = match ProtocolMessage::deser(&mut packet.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("unparsable offline message from {:?} - dropping: {}", from, e);
                return;
            }
        };

        let server_guid = self.config.guid;
        let reply = match msg {
            ProtocolMessage::UnconnectedPing { timestamp, open_connections_only, .. } => {
                if open_connections_only && !self.accepts_new_peers().await {
                    return;
                }
                ProtocolMessage::UnconnectedPong {
                    timestamp,
                    server_guid,
                    identifier: self.config.identifier.clone(),
                }
            }
            ProtocolMessage::OpenConnectionRequest1 { protocol_version, mtu } => {
                if protocol_version != self.config.protocol_version {
                    debug!("{:?} speaks protocol version {}, we speak {}", from, protocol_version, self.config.protocol_version);
                    ProtocolMessage::IncompatibleProtocolVersion {
                        protocol_version: self.config.protocol_version,
                        server_guid,
                    }
                }
                else if let Some(rejection) = self.check_new_peer(from).await {
                    rejection
                }
                else {
                    ProtocolMessage::OpenConnectionReply1 {
                        server_guid,
                        use_security: false,
                        mtu: self.negotiate_mtu(mtu),
                    }
                }
            }
            ProtocolMessage::OpenConnectionRequest2 { mtu, client_guid, .. } => {
                let mtu = self.negotiate_mtu(mtu);

                let mut peers = self.peers.write().await;
                if let Some(rejection) = self.rejection_for(&peers, from) {
                    rejection
                }
                else {
                    info!("incoming connection from {:?} with MTU {}", from, mtu);
                    let session = PeerSession::new(self.config.clone(), PeerRole::Server, from, client_guid, mtu, now);
                    peers.insert(from, Arc::new(Mutex::new(session)));

                    ProtocolMessage::OpenConnectionReply2 {
                        server_guid,
                        client_address: from,
                        mtu,
                        use_encryption: false,
                    }
                }
            }
            other => {
                debug!("ignoring offline message {:?} from {:?}", other, from);
                return;
            }
        };

        match reply.encode() {
            Ok(buf) => self.send_socket.do_send_packet(from, &buf).await,
            Err(e) => warn!("failed to encode reply to {:?}: {}", from, e),
        }
    }

    fn negotiate_mtu(&self, requested: u16) -> u16 {
        requested.clamp(self.config.min_mtu, self.config.max_mtu)
    }

    async fn accepts_new_peers(&self) -> bool {
        self.config.accept_incoming && self.peers.read().await.len() < self.config.max_connections
    }

    async fn check_new_peer(&self, from: SocketAddr) -> Option<ProtocolMessage> {
        let peers = self.peers.read().await;
        self.rejection_for(&peers, from)
    }

    fn rejection_for(&self, peers: &PeerMap, from: SocketAddr) -> Option<ProtocolMessage> {
        let server_guid = self.config.guid;
        if peers.contains_key(&from) {
            debug!("{:?} is connected already", from);
            Some(ProtocolMessage::AlreadyConnected { server_guid })
        }
        else if !self.config.accept_incoming || peers.len() >= self.config.max_connections {
            debug!("rejecting connection attempt from {:?}", from);
            Some(ProtocolMessage::NoFreeIncomingConnections { server_guid })
        }
        else {
            None
        }
    }

    /// Drives all sessions' timers and sends whatever they have to send. Closed sessions are
    ///  removed.
    pub async fn on_tick(&self, now: Instant) {
        let peers = self.peers.read().await
            .iter()
            .map(|(addr, peer)| (*addr, peer.clone()))
            .collect::<Vec<_>>();

        let mut closed = Vec::new();
        for (peer_addr, peer) in peers {
            let (packets, events, is_closed) = {
                let mut session = peer.lock().await;
                session.on_tick(now);
                let packets = session.flush_outgoing(now);
                (packets, Self::drain_events(&mut session), session.is_closed())
            };

            self.send_packets(peer_addr, packets).await;
            self.dispatch_events(peer_addr, events).await;
            if is_closed {
                closed.push((peer_addr, peer));
            }
        }

        if !closed.is_empty() {
            let mut peers = self.peers.write().await;
            for (peer_addr, peer) in closed {
                // the peer may have reconnected in the meantime
                if peers.get(&peer_addr).is_some_and(|p| Arc::ptr_eq(p, &peer)) {
                    debug!("removing closed session for {:?}", peer_addr);
                    peers.remove(&peer_addr);
                }
            }
        }
    }

    async fn get_peer(&self, peer_addr: SocketAddr) -> Option<Arc<Mutex<PeerSession>>> {
        self.peers.read().await
            .get(&peer_addr)
            .cloned()
    }

    fn drain_events(session: &mut PeerSession) -> Vec<SessionEvent> {
        let mut result = Vec::new();
        while let Some(evt) = session.poll_event() {
            result.push(evt);
        }
        result
    }

    async fn send_packets(&self, peer_addr: SocketAddr, packets: Vec<Bytes>) {
        for packet in packets {
            self.send_socket.do_send_packet(peer_addr, &packet).await;
        }
    }

    async fn dispatch_events(&self, peer_addr: SocketAddr, events: Vec<SessionEvent>) {
        for evt in events {
            match evt {
                SessionEvent::Connected => self.message_dispatcher.on_connected(peer_addr).await,
                SessionEvent::Message { channel, payload } => self.message_dispatcher.on_message(peer_addr, channel, &payload).await,
                SessionEvent::AckReceipt(receipt_id) => self.message_dispatcher.on_ack_receipt(peer_addr, receipt_id).await,
                SessionEvent::AckReceiptLoss(receipt_id) => self.message_dispatcher.on_ack_receipt_loss(peer_addr, receipt_id).await,
                SessionEvent::Disconnected(reason) => self.message_dispatcher.on_disconnect(peer_addr, reason).await,
            }
        }
    }
}
