pub mod message_id;

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::datagram::UDP_HEADER_ALLOWANCE;
use crate::error::{WireError, WireResult};
use crate::wire::codec::{RakBuf, RakBufMut, MAGIC};
use message_id::*;

/// Number of internal addresses RakNet puts into the login messages. Nobody seems to know what
///  they are for; they are written as 0.0.0.0:0 and skipped when reading.
pub const NUM_SYSTEM_ADDRESSES: usize = 10;

/// two trailing timestamps after the system addresses in login messages
const LOGIN_TIMESTAMPS_LEN: usize = 16;

/// The protocol's own messages, both offline (handshake, status) and connected (keep-alive,
///  login, disconnect). Each variant is identified by its first byte on the wire.
///
/// Payloads with other ids are application messages and are not represented here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolMessage {
    ConnectedPing { timestamp: i64 },
    UnconnectedPing { timestamp: i64, client_guid: u64, open_connections_only: bool },
    ConnectedPong { ping_timestamp: i64, pong_timestamp: i64 },
    DetectLostConnections,
    OpenConnectionRequest1 { protocol_version: u8, mtu: u16 },
    OpenConnectionReply1 { server_guid: u64, use_security: bool, mtu: u16 },
    OpenConnectionRequest2 { server_address: SocketAddr, mtu: u16, client_guid: u64 },
    OpenConnectionReply2 { server_guid: u64, client_address: SocketAddr, mtu: u16, use_encryption: bool },
    ConnectionRequest { client_guid: u64, timestamp: i64, use_security: bool },
    ConnectionRequestAccepted { client_address: SocketAddr, system_index: u16, request_timestamp: i64, accepted_timestamp: i64 },
    ConnectionAttemptFailed,
    AlreadyConnected { server_guid: u64 },
    NewIncomingConnection { server_address: SocketAddr, server_timestamp: i64, client_timestamp: i64 },
    NoFreeIncomingConnections { server_guid: u64 },
    DisconnectionNotification,
    ConnectionLost,
    IncompatibleProtocolVersion { protocol_version: u8, server_guid: u64 },
    UnconnectedPong { timestamp: i64, server_guid: u64, identifier: String },
}

impl ProtocolMessage {
    pub fn id(&self) -> u8 {
        use ProtocolMessage::*;
        match self {
            ConnectedPing { .. } => ID_CONNECTED_PING,
            UnconnectedPing { open_connections_only: false, .. } => ID_UNCONNECTED_PING,
            UnconnectedPing { open_connections_only: true, .. } => ID_UNCONNECTED_PING_OPEN_CONNECTIONS,
            ConnectedPong { .. } => ID_CONNECTED_PONG,
            DetectLostConnections => ID_DETECT_LOST_CONNECTIONS,
            OpenConnectionRequest1 { .. } => ID_OPEN_CONNECTION_REQUEST_1,
            OpenConnectionReply1 { .. } => ID_OPEN_CONNECTION_REPLY_1,
            OpenConnectionRequest2 { .. } => ID_OPEN_CONNECTION_REQUEST_2,
            OpenConnectionReply2 { .. } => ID_OPEN_CONNECTION_REPLY_2,
            ConnectionRequest { .. } => ID_CONNECTION_REQUEST,
            ConnectionRequestAccepted { .. } => ID_CONNECTION_REQUEST_ACCEPTED,
            ConnectionAttemptFailed => ID_CONNECTION_ATTEMPT_FAILED,
            AlreadyConnected { .. } => ID_ALREADY_CONNECTED,
            NewIncomingConnection { .. } => ID_NEW_INCOMING_CONNECTION,
            NoFreeIncomingConnections { .. } => ID_NO_FREE_INCOMING_CONNECTIONS,
            DisconnectionNotification => ID_DISCONNECTION_NOTIFICATION,
            ConnectionLost => ID_CONNECTION_LOST,
            IncompatibleProtocolVersion { .. } => ID_INCOMPATIBLE_PROTOCOL_VERSION,
            UnconnectedPong { .. } => ID_UNCONNECTED_PONG,
        }
    }

    /// true for ids that are exchanged outside a connection, i.e. not wrapped in datagrams
    pub fn is_offline_id(id: u8) -> bool {
        matches!(id,
            ID_UNCONNECTED_PING | ID_UNCONNECTED_PING_OPEN_CONNECTIONS | ID_UNCONNECTED_PONG
            | ID_OPEN_CONNECTION_REQUEST_1 | ID_OPEN_CONNECTION_REPLY_1
            | ID_OPEN_CONNECTION_REQUEST_2 | ID_OPEN_CONNECTION_REPLY_2
            | ID_ALREADY_CONNECTED | ID_NO_FREE_INCOMING_CONNECTIONS | ID_INCOMPATIBLE_PROTOCOL_VERSION)
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> WireResult<()> {
        use ProtocolMessage::*;

        buf.put_u8(self.id());
        match self {
            ConnectedPing { timestamp } => {
                buf.put_i64(*timestamp);
            }
            UnconnectedPing { timestamp, client_guid, .. } => {
                buf.put_i64(*timestamp);
                buf.put_magic();
                buf.put_u64(*client_guid);
            }
            ConnectedPong { ping_timestamp, pong_timestamp } => {
                buf.put_i64(*ping_timestamp);
                buf.put_i64(*pong_timestamp);
            }
            OpenConnectionRequest1 { protocol_version, mtu } => {
                buf.put_magic();
                buf.put_u8(*protocol_version);
                let padding = (*mtu as usize).saturating_sub(UDP_HEADER_ALLOWANCE + 2 + MAGIC.len());
                buf.put_bytes(0, padding);
            }
            OpenConnectionReply1 { server_guid, use_security, mtu } => {
                buf.put_magic();
                buf.put_u64(*server_guid);
                buf.put_bool(*use_security);
                buf.put_u16(*mtu);
            }
            OpenConnectionRequest2 { server_address, mtu, client_guid } => {
                buf.put_magic();
                buf.put_address(*server_address)?;
                buf.put_u16(*mtu);
                buf.put_u64(*client_guid);
            }
            OpenConnectionReply2 { server_guid, client_address, mtu, use_encryption } => {
                buf.put_magic();
                buf.put_u64(*server_guid);
                buf.put_address(*client_address)?;
                buf.put_u16(*mtu);
                buf.put_bool(*use_encryption);
            }
            ConnectionRequest { client_guid, timestamp, use_security } => {
                buf.put_u64(*client_guid);
                buf.put_i64(*timestamp);
                buf.put_bool(*use_security);
            }
            ConnectionRequestAccepted { client_address, system_index, request_timestamp, accepted_timestamp } => {
                buf.put_address(*client_address)?;
                buf.put_u16(*system_index);
                Self::put_system_addresses(buf)?;
                buf.put_i64(*request_timestamp);
                buf.put_i64(*accepted_timestamp);
            }
            NewIncomingConnection { server_address, server_timestamp, client_timestamp } => {
                buf.put_address(*server_address)?;
                Self::put_system_addresses(buf)?;
                buf.put_i64(*server_timestamp);
                buf.put_i64(*client_timestamp);
            }
            AlreadyConnected { server_guid } | NoFreeIncomingConnections { server_guid } => {
                buf.put_magic();
                buf.put_u64(*server_guid);
            }
            IncompatibleProtocolVersion { protocol_version, server_guid } => {
                buf.put_u8(*protocol_version);
                buf.put_magic();
                buf.put_u64(*server_guid);
            }
            UnconnectedPong { timestamp, server_guid, identifier } => {
                buf.put_i64(*timestamp);
                buf.put_u64(*server_guid);
                buf.put_magic();
                buf.put_string(identifier);
            }
            DetectLostConnections | ConnectionAttemptFailed | DisconnectionNotification | ConnectionLost => {}
        }
        Ok(())
    }

    pub fn encode(&self) -> WireResult<Bytes> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Trailing bytes after the known fields are ignored: several RakNet implementations append
    ///  their own data to some of these messages.
    pub fn deser(buf: &mut impl Buf) -> WireResult<ProtocolMessage> {
        use ProtocolMessage::*;

        let id = buf.read_u8()?;
        let result = match id {
            ID_CONNECTED_PING => ConnectedPing {
                timestamp: buf.read_i64()?,
            },
            ID_UNCONNECTED_PING | ID_UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let timestamp = buf.read_i64()?;
                buf.read_magic()?;
                let client_guid = buf.read_u64()?;
                UnconnectedPing { timestamp, client_guid, open_connections_only: id == ID_UNCONNECTED_PING_OPEN_CONNECTIONS }
            }
            ID_CONNECTED_PONG => ConnectedPong {
                ping_timestamp: buf.read_i64()?,
                pong_timestamp: buf.read_i64()?,
            },
            ID_DETECT_LOST_CONNECTIONS => DetectLostConnections,
            ID_OPEN_CONNECTION_REQUEST_1 => {
                buf.read_magic()?;
                let protocol_version = buf.read_u8()?;
                let total_len = 2 + MAGIC.len() + buf.remaining();
                buf.advance(buf.remaining());
                let mtu = (total_len + UDP_HEADER_ALLOWANCE).min(u16::MAX as usize) as u16;
                OpenConnectionRequest1 { protocol_version, mtu }
            }
            ID_OPEN_CONNECTION_REPLY_1 => {
                buf.read_magic()?;
                OpenConnectionReply1 {
                    server_guid: buf.read_u64()?,
                    use_security: buf.read_bool()?,
                    mtu: buf.read_u16()?,
                }
            }
            ID_OPEN_CONNECTION_REQUEST_2 => {
                buf.read_magic()?;
                OpenConnectionRequest2 {
                    server_address: buf.read_address()?,
                    mtu: buf.read_u16()?,
                    client_guid: buf.read_u64()?,
                }
            }
            ID_OPEN_CONNECTION_REPLY_2 => {
                buf.read_magic()?;
                OpenConnectionReply2 {
                    server_guid: buf.read_u64()?,
                    client_address: buf.read_address()?,
                    mtu: buf.read_u16()?,
                    use_encryption: buf.read_bool()?,
                }
            }
            ID_CONNECTION_REQUEST => ConnectionRequest {
                client_guid: buf.read_u64()?,
                timestamp: buf.read_i64()?,
                use_security: buf.read_bool()?,
            },
            ID_CONNECTION_REQUEST_ACCEPTED => {
                let client_address = buf.read_address()?;
                let system_index = buf.read_u16()?;
                Self::skip_system_addresses(buf)?;
                ConnectionRequestAccepted {
                    client_address,
                    system_index,
                    request_timestamp: buf.read_i64()?,
                    accepted_timestamp: buf.read_i64()?,
                }
            }
            ID_CONNECTION_ATTEMPT_FAILED => ConnectionAttemptFailed,
            ID_ALREADY_CONNECTED => {
                buf.read_magic()?;
                AlreadyConnected { server_guid: buf.read_u64()? }
            }
            ID_NEW_INCOMING_CONNECTION => {
                let server_address = buf.read_address()?;
                Self::skip_system_addresses(buf)?;
                NewIncomingConnection {
                    server_address,
                    server_timestamp: buf.read_i64()?,
                    client_timestamp: buf.read_i64()?,
                }
            }
            ID_NO_FREE_INCOMING_CONNECTIONS => {
                buf.read_magic()?;
                NoFreeIncomingConnections { server_guid: buf.read_u64()? }
            }
            ID_DISCONNECTION_NOTIFICATION => DisconnectionNotification,
            ID_CONNECTION_LOST => ConnectionLost,
            ID_INCOMPATIBLE_PROTOCOL_VERSION => {
                let protocol_version = buf.read_u8()?;
                buf.read_magic()?;
                IncompatibleProtocolVersion { protocol_version, server_guid: buf.read_u64()? }
            }
            ID_UNCONNECTED_PONG => {
                let timestamp = buf.read_i64()?;
                let server_guid = buf.read_u64()?;
                buf.read_magic()?;
                UnconnectedPong { timestamp, server_guid, identifier: buf.read_string()? }
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(result)
    }

    fn put_system_addresses(buf: &mut impl BufMut) -> WireResult<()> {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.put_address(unspecified)?;
        }
        Ok(())
    }

    /// Different RakNet versions send different numbers of system addresses, so we skip
    ///  addresses until only the trailing timestamps are left.
    fn skip_system_addresses(buf: &mut impl Buf) -> WireResult<()> {
        while buf.remaining() > LOGIN_TIMESTAMPS_LEN {
            buf.read_address()?;
        }
        Ok(())
    }
}
