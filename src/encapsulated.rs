use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};
use crate::reliability::Reliability;
use crate::safe_converter::PrecheckedCast;
use crate::wire::codec::{RakBuf, RakBufMut};
use crate::wire::index::Index24;

const FLAG_SPLIT: u8 = 0x10;
const RELIABILITY_SHIFT: u8 = 5;

/// header byte + payload length
pub const MIN_HEADER_LEN: usize = 3;
const MESSAGE_INDEX_LEN: usize = 3;
const ORDER_INFO_LEN: usize = 4;
pub const SPLIT_HEADER_LEN: usize = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OrderInfo {
    pub index: Index24,
    pub channel: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One application message (or one fragment of a split application message) with its
///  reliability metadata, as it is carried inside a datagram:
///
/// ```ascii
/// 0: flags (u8): bits 7-5 reliability id, bit 4 'split'
/// 1: payload length in *bits* (u16 BE)
/// *: message index (triad LE), present for reliable messages only
/// *: order index (triad LE) and order channel (u8), present for ordered and sequenced messages only
/// *: split count (u32 BE), split id (u16 BE), split index (u32 BE), present for fragments only
/// *: payload
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncapsulatedMessage {
    pub reliability: Reliability,
    pub message_index: Option<Index24>,
    pub order: Option<OrderInfo>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl EncapsulatedMessage {
    pub fn header_len(reliability: Reliability, is_split: bool) -> usize {
        let mut result = MIN_HEADER_LEN;
        if reliability.is_reliable() {
            result += MESSAGE_INDEX_LEN;
        }
        if reliability.has_order_info() {
            result += ORDER_INFO_LEN;
        }
        if is_split {
            result += SPLIT_HEADER_LEN;
        }
        result
    }

    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.reliability, self.split.is_some()) + self.payload.len()
    }

    pub fn order_channel(&self) -> u8 {
        self.order.map(|o| o.channel).unwrap_or(0)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = self.reliability.id() << RELIABILITY_SHIFT;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8).prechecked_cast());

        if self.reliability.is_reliable() {
            buf.put_triad(self.message_index.unwrap_or_default().to_raw());
        }
        if self.reliability.has_order_info() {
            let order = self.order.unwrap_or(OrderInfo { index: Index24::ZERO, channel: 0 });
            buf.put_triad(order.index.to_raw());
            buf.put_u8(order.channel);
        }
        if let Some(split) = &self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> WireResult<EncapsulatedMessage> {
        let flags = buf.read_u8()?;
        let reliability = Reliability::from_id(flags >> RELIABILITY_SHIFT)?;
        let is_split = flags & FLAG_SPLIT != 0;

        let len_bits = buf.read_u16()? as usize;
        let len = len_bits.div_ceil(8);

        let message_index = if reliability.is_reliable() {
            Some(Index24::new(buf.read_triad()?))
        }
        else {
            None
        };

        let order = if reliability.has_order_info() {
            let index = Index24::new(buf.read_triad()?);
            let channel = buf.read_u8()?;
            Some(OrderInfo { index, channel })
        }
        else {
            None
        };

        let split = if is_split {
            let count = buf.read_u32()?;
            let id = buf.read_u16()?;
            let index = buf.read_u32()?;
            if count == 0 || index >= count {
                return Err(WireError::malformed(format!("inconsistent split header: index {} of {}", index, count)));
            }
            Some(SplitInfo { count, id, index })
        }
        else {
            None
        };

        if len > buf.remaining() {
            return Err(WireError::malformed(format!("declared payload length {} exceeds the remaining {} bytes", len, buf.remaining())));
        }
        let payload = buf.copy_to_bytes(len);

        Ok(EncapsulatedMessage {
            reliability,
            message_index,
            order,
            split,
            payload,
        })
    }
}
