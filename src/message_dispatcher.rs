use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::session::DisconnectReason;

/// The application's view of the transport: everything that happens to a peer session and is
///  of interest to the application is reported through this trait.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// the login exchange with a peer completed, messages can be sent to it now
    async fn on_connected(&self, peer_addr: SocketAddr);

    /// `msg_buf` starts with the message's id byte
    async fn on_message(&self, peer_addr: SocketAddr, channel: u8, msg_buf: &[u8]);

    async fn on_ack_receipt(&self, peer_addr: SocketAddr, receipt_id: u32);

    async fn on_ack_receipt_loss(&self, peer_addr: SocketAddr, receipt_id: u32);

    async fn on_disconnect(&self, peer_addr: SocketAddr, reason: DisconnectReason);
}
