use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::encapsulated::{EncapsulatedMessage, MIN_HEADER_LEN};
use crate::error::{WireError, WireResult};
use crate::wire::codec::{RakBuf, RakBufMut, TRIAD_LEN};
use crate::wire::index::Index24;

pub const ID_DATAGRAM_MIN: u8 = 0x80;
pub const ID_DATAGRAM_MAX: u8 = 0x8F;
/// the id this implementation uses for the datagrams it sends
pub const ID_DATAGRAM: u8 = 0x84;

/// id + sequence number
pub const DATAGRAM_HEADER_LEN: usize = 1 + TRIAD_LEN;

/// The encoded length of a datagram must leave room for the IP and UDP headers inside the
///  negotiated MTU.
pub const UDP_HEADER_ALLOWANCE: usize = 28;

/// A datagram carrying application data ('custom packet'):
///
/// ```ascii
/// 0: id (u8), 0x80 to 0x8F
/// 1: sequence number (triad LE)
/// 4: encapsulated messages, concatenated until the end of the datagram
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CustomDatagram {
    pub sequence_number: Index24,
    pub messages: Vec<EncapsulatedMessage>,
}

impl CustomDatagram {
    pub fn is_datagram_id(id: u8) -> bool {
        (ID_DATAGRAM_MIN..=ID_DATAGRAM_MAX).contains(&id)
    }

    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_LEN + self.messages.iter()
            .map(|m| m.encoded_len())
            .sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ID_DATAGRAM);
        buf.put_triad(self.sequence_number.to_raw());
        for message in &self.messages {
            message.ser(buf);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> WireResult<CustomDatagram> {
        let id = buf.read_u8()?;
        if !Self::is_datagram_id(id) {
            return Err(WireError::UnknownMessageId(id));
        }
        let sequence_number = Index24::new(buf.read_triad()?);

        let mut messages = Vec::new();
        while buf.remaining() >= MIN_HEADER_LEN {
            messages.push(EncapsulatedMessage::deser(buf)?);
        }

        Ok(CustomDatagram {
            sequence_number,
            messages,
        })
    }
}
