use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};
use crate::safe_converter::PrecheckedCast;
use crate::wire::codec::{RakBuf, RakBufMut, TRIAD_LEN};
use crate::wire::index::Index24;

pub const ID_ACK: u8 = 0xC0;
pub const ID_NACK: u8 = 0xA0;

const RECORD_RANGE: u8 = 0;
const RECORD_SINGLE: u8 = 1;

/// id + record count
pub const ACK_HEADER_LEN: usize = 3;
pub const MAX_RECORD_LEN: usize = 1 + 2 * TRIAD_LEN;

/// Upper bound for the number of sequence numbers in a single received range record. This
///  protects against a peer making us iterate over the entire index space.
pub const MAX_RECORD_SPAN: u32 = 1 << 16;

/// A contiguous range of datagram sequence numbers, `first` and `last` inclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AckRecord {
    pub first: Index24,
    pub last: Index24,
}

impl AckRecord {
    pub fn single(index: Index24) -> AckRecord {
        AckRecord { first: index, last: index }
    }

    pub fn range(first: Index24, last: Index24) -> AckRecord {
        AckRecord { first, last }
    }

    pub fn is_single(&self) -> bool {
        self.first == self.last
    }

    pub fn len(&self) -> u32 {
        self.last.distance_from(self.first) + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = Index24> {
        let first = self.first;
        (0..self.len()).map(move |offs| first.plus(offs))
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_single() { 1 + TRIAD_LEN } else { 1 + 2 * TRIAD_LEN }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        if self.is_single() {
            buf.put_u8(RECORD_SINGLE);
            buf.put_triad(self.first.to_raw());
        }
        else {
            buf.put_u8(RECORD_RANGE);
            buf.put_triad(self.first.to_raw());
            buf.put_triad(self.last.to_raw());
        }
    }

    fn deser(buf: &mut impl Buf) -> WireResult<AckRecord> {
        let result = match buf.read_u8()? {
            RECORD_SINGLE => AckRecord::single(Index24::new(buf.read_triad()?)),
            _ => {
                let first = Index24::new(buf.read_triad()?);
                let last = Index24::new(buf.read_triad()?);
                AckRecord::range(first, last)
            }
        };

        if result.len() > MAX_RECORD_SPAN {
            return Err(WireError::malformed(format!("ack record {}..{} is too long", result.first, result.last)));
        }
        Ok(result)
    }
}

/// Sorts the sequence numbers and merges contiguous runs into range records. Duplicates are
///  removed.
///
/// NB: Sorting is by raw value, so a run that crosses the 24-bit wrap-around ends up as two
///  records. That is a little less compact, but still correct.
pub fn condense(indices: impl IntoIterator<Item = Index24>) -> Vec<AckRecord> {
    let mut raw = indices.into_iter()
        .map(|i| i.to_raw())
        .collect::<Vec<_>>();
    raw.sort_unstable();
    raw.dedup();

    let mut result: Vec<AckRecord> = Vec::new();
    for r in raw {
        let index = Index24::new(r);
        match result.last_mut() {
            Some(record) if record.last.next() == index => {
                record.last = index;
            }
            _ => result.push(AckRecord::single(index)),
        }
    }
    result
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckKind {
    Ack,
    Nack,
}

/// An ACK or NACK packet:
///
/// ```ascii
/// 0: id (u8): 0xC0 for ACK, 0xA0 for NACK
/// 1: number of records (u16 BE)
/// *: records, each either
///     * 0x01 (u8), sequence number (triad LE)
///     * 0x00 (u8), first sequence number (triad LE), last sequence number (triad LE)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Acknowledgement {
    pub kind: AckKind,
    pub records: Vec<AckRecord>,
}

impl Acknowledgement {
    pub fn id(&self) -> u8 {
        match self.kind {
            AckKind::Ack => ID_ACK,
            AckKind::Nack => ID_NACK,
        }
    }

    pub fn kind_for_id(id: u8) -> Option<AckKind> {
        match id {
            ID_ACK => Some(AckKind::Ack),
            ID_NACK => Some(AckKind::Nack),
            _ => None,
        }
    }

    /// Builds as few packets as possible for the given sequence numbers, each fitting into
    ///  `max_len` bytes.
    pub fn build(kind: AckKind, indices: impl IntoIterator<Item = Index24>, max_len: usize) -> Vec<Acknowledgement> {
        let mut result = Vec::new();

        let mut current = Vec::new();
        let mut current_len = ACK_HEADER_LEN;
        for record in condense(indices) {
            if current_len + record.encoded_len() > max_len && !current.is_empty() {
                result.push(Acknowledgement { kind, records: std::mem::take(&mut current) });
                current_len = ACK_HEADER_LEN;
            }
            current_len += record.encoded_len();
            current.push(record);
        }
        if !current.is_empty() {
            result.push(Acknowledgement { kind, records: current });
        }
        result
    }

    pub fn indices(&self) -> impl Iterator<Item = Index24> + '_ {
        self.records.iter()
            .flat_map(|r| r.iter())
    }

    pub fn encoded_len(&self) -> usize {
        ACK_HEADER_LEN + self.records.iter()
            .map(|r| r.encoded_len())
            .sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        buf.put_u16(self.records.len().prechecked_cast());
        for record in &self.records {
            record.ser(buf);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> WireResult<Acknowledgement> {
        let id = buf.read_u8()?;
        let kind = Self::kind_for_id(id)
            .ok_or(WireError::UnknownMessageId(id))?;

        let num_records = buf.read_u16()?;
        let mut records = Vec::new();
        for _ in 0..num_records {
            records.push(AckRecord::deser(buf)?);
        }

        Ok(Acknowledgement { kind, records })
    }
}
