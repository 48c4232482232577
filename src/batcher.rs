use std::cmp::min;
use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::datagram::{DATAGRAM_HEADER_LEN, UDP_HEADER_ALLOWANCE};
use crate::encapsulated::{EncapsulatedMessage, OrderInfo, SplitInfo};
use crate::error::SendError;
use crate::reliability::Reliability;
use crate::wire::index::Index24;

/// A message waiting to be put into a datagram, either for the first time or for resending.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueuedMessage {
    pub message: EncapsulatedMessage,
    /// the ack receipt the application requested for the message this is (a fragment of)
    pub receipt: Option<u32>,
    pub is_resend: bool,
}

/// The per-peer outgoing queue. It assigns message indices, order / sequence indices and split
///  ids when the application sends a message, and packs queued messages into MTU-sized batches
///  in FIFO order.
pub struct SendQueue {
    queue: VecDeque<QueuedMessage>,

    next_message_index: Index24,
    next_order_index: Vec<Index24>,
    next_sequence_index: Vec<Index24>,
    next_split_id: u16,

    /// the number of bytes available for encapsulated messages in a single datagram
    message_capacity: usize,
    max_fragments: u32,
}

impl SendQueue {
    pub fn new(mtu: u16, order_channels: u8, max_fragments: u32) -> SendQueue {
        SendQueue {
            queue: Default::default(),
            next_message_index: Index24::ZERO,
            next_order_index: vec![Index24::ZERO; order_channels as usize],
            next_sequence_index: vec![Index24::ZERO; order_channels as usize],
            next_split_id: 0,
            message_capacity: Self::max_datagram_len(mtu) - DATAGRAM_HEADER_LEN,
            max_fragments,
        }
    }

    /// the maximum encoded length of a datagram for a given MTU
    pub fn max_datagram_len(mtu: u16) -> usize {
        mtu as usize - UDP_HEADER_ALLOWANCE
    }

    pub fn message_capacity(&self) -> usize {
        self.message_capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// the biggest payload that can be sent with a given reliability
    pub fn max_payload_len(&self, reliability: Reliability) -> usize {
        let fragment_len = self.message_capacity - EncapsulatedMessage::header_len(reliability.for_split(), true);
        fragment_len * self.max_fragments as usize
    }

    /// Creates the encapsulated message(s) for an application message and appends them to the
    ///  queue, splitting the payload if it does not fit into a single datagram. Returns the number
    ///  of encapsulated messages created.
    pub fn enqueue_send(&mut self, reliability: Reliability, channel: u8, payload: Bytes, receipt: Option<u32>) -> Result<usize, SendError> {
        if channel as usize >= self.next_order_index.len() {
            return Err(SendError::InvalidChannel(channel));
        }

        let max_len = self.max_payload_len(reliability);
        if payload.len() > max_len {
            return Err(SendError::MessageTooLarge { len: payload.len(), max: max_len });
        }

        if EncapsulatedMessage::header_len(reliability, false) + payload.len() <= self.message_capacity {
            let message = EncapsulatedMessage {
                reliability,
                message_index: self.next_message_index(reliability),
                order: self.next_order_info(reliability, channel),
                split: None,
                payload,
            };
            self.queue.push_back(QueuedMessage { message, receipt, is_resend: false });
            return Ok(1);
        }

        let reliability = reliability.for_split();
        let fragment_len = self.message_capacity - EncapsulatedMessage::header_len(reliability, true);
        let count = payload.len().div_ceil(fragment_len);

        let order = self.next_order_info(reliability, channel);
        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        trace!("splitting message of {} bytes into {} fragments with split id {}", payload.len(), count, split_id);

        for (index, start) in (0..payload.len()).step_by(fragment_len).enumerate() {
            let end = min(start + fragment_len, payload.len());
            let message = EncapsulatedMessage {
                reliability,
                message_index: self.next_message_index(reliability),
                order,
                split: Some(SplitInfo {
                    count: count as u32,
                    id: split_id,
                    index: index as u32,
                }),
                payload: payload.slice(start..end),
            };
            self.queue.push_back(QueuedMessage { message, receipt, is_resend: false });
        }
        Ok(count)
    }

    /// Puts messages at the head of the queue, preserving their relative order, so they are
    ///  sent before anything that is not sent yet.
    pub fn requeue_front(&mut self, messages: Vec<QueuedMessage>) {
        for mut msg in messages.into_iter().rev() {
            msg.is_resend = true;
            self.queue.push_front(msg);
        }
    }

    /// Removes queued messages in FIFO order, grouping them into batches that each fit into a
    ///  single datagram.
    pub fn pack(&mut self, max_datagrams: usize) -> Vec<Vec<QueuedMessage>> {
        let mut result = Vec::new();

        while result.len() < max_datagrams && !self.queue.is_empty() {
            let mut batch = Vec::new();
            let mut batch_len = 0;

            while let Some(next) = self.queue.front() {
                let len = next.message.encoded_len();
                if !batch.is_empty() && batch_len + len > self.message_capacity {
                    break;
                }
                batch_len += len;
                if let Some(msg) = self.queue.pop_front() {
                    batch.push(msg);
                }
            }
            result.push(batch);
        }
        result
    }

    fn next_message_index(&mut self, reliability: Reliability) -> Option<Index24> {
        if reliability.is_reliable() {
            Some(self.next_message_index.post_increment())
        }
        else {
            None
        }
    }

    fn next_order_info(&mut self, reliability: Reliability, channel: u8) -> Option<OrderInfo> {
        let counters = if reliability.is_ordered() {
            &mut self.next_order_index
        }
        else if reliability.is_sequenced() {
            &mut self.next_sequence_index
        }
        else {
            return None;
        };

        Some(OrderInfo {
            index: counters[channel as usize].post_increment(),
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| i as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_capacity() {
        let queue = SendQueue::new(548, 32, 128);
        assert_eq!(SendQueue::max_datagram_len(548), 520);
        assert_eq!(queue.message_capacity(), 516);
        assert_eq!(queue.max_payload_len(Reliability::ReliableOrdered), 496 * 128);
        assert_eq!(queue.max_payload_len(Reliability::Unreliable), 500 * 128);
    }

    #[rstest]
    #[case::unreliable(Reliability::Unreliable, None, None)]
    #[case::reliable(Reliability::Reliable, Some(0), None)]
    #[case::ordered(Reliability::ReliableOrdered, Some(0), Some(0))]
    #[case::sequenced(Reliability::UnreliableSequenced, None, Some(0))]
    fn test_enqueue_single(#[case] reliability: Reliability, #[case] message_index: Option<u32>, #[case] order_index: Option<u32>) {
        let mut queue = SendQueue::new(548, 32, 128);
        assert_eq!(queue.enqueue_send(reliability, 3, payload(10), None), Ok(1));

        let batches = queue.pack(10);
        assert_eq!(batches.len(), 1);
        let msg = &batches[0][0].message;
        assert_eq!(msg.reliability, reliability);
        assert_eq!(msg.message_index, message_index.map(Index24::new));
        assert_eq!(msg.order.map(|o| o.index), order_index.map(Index24::new));
        assert_eq!(msg.order.map(|o| o.channel), order_index.map(|_| 3));
        assert_eq!(msg.split, None);
        assert_eq!(msg.payload, payload(10));
    }

    #[test]
    fn test_counters_advance_independently() {
        let mut queue = SendQueue::new(548, 32, 128);
        queue.enqueue_send(Reliability::ReliableOrdered, 0, payload(1), None).unwrap();
        queue.enqueue_send(Reliability::ReliableOrdered, 1, payload(1), None).unwrap();
        queue.enqueue_send(Reliability::ReliableOrdered, 0, payload(1), None).unwrap();
        queue.enqueue_send(Reliability::UnreliableSequenced, 0, payload(1), None).unwrap();
        queue.enqueue_send(Reliability::Unreliable, 0, payload(1), None).unwrap();
        queue.enqueue_send(Reliability::Reliable, 0, payload(1), None).unwrap();

        let messages = queue.pack(10).into_iter().flatten().map(|m| m.message).collect::<Vec<_>>();
        assert_eq!(messages.iter().map(|m| m.message_index.map(|i| i.to_raw())).collect::<Vec<_>>(),
                   vec![Some(0), Some(1), Some(2), None, None, Some(3)]);
        assert_eq!(messages.iter().map(|m| m.order.map(|o| (o.index.to_raw(), o.channel))).collect::<Vec<_>>(),
                   vec![Some((0, 0)), Some((0, 1)), Some((1, 0)), Some((0, 0)), None, None]);
    }

    #[test]
    fn test_split_shares_order_info() {
        let mut queue = SendQueue::new(548, 32, 128);
        let data = payload(2000);
        assert_eq!(queue.enqueue_send(Reliability::ReliableOrdered, 0, data.clone(), Some(7)), Ok(5));
        queue.enqueue_send(Reliability::ReliableOrdered, 0, payload(3), None).unwrap();

        let messages = queue.pack(100).into_iter().flatten().collect::<Vec<_>>();
        assert_eq!(messages.len(), 6);

        let fragments = &messages[..5];
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.receipt, Some(7));
            assert_eq!(f.message.message_index, Some(Index24::new(i as u32)));
            assert_eq!(f.message.order, Some(OrderInfo { index: Index24::ZERO, channel: 0 }));
            assert_eq!(f.message.split, Some(SplitInfo { count: 5, id: 0, index: i as u32 }));
            assert!(f.message.encoded_len() <= 516);
        }
        let reassembled = fragments.iter()
            .flat_map(|f| f.message.payload.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(reassembled, data.to_vec());

        // the split message consumed a single order index
        assert_eq!(messages[5].message.order, Some(OrderInfo { index: Index24::new(1), channel: 0 }));
        assert_eq!(messages[5].message.message_index, Some(Index24::new(5)));
    }

    #[test]
    fn test_split_upgrades_unreliable() {
        let mut queue = SendQueue::new(548, 32, 128);
        queue.enqueue_send(Reliability::Unreliable, 0, payload(600), None).unwrap();
        queue.enqueue_send(Reliability::Unreliable, 0, payload(600), None).unwrap();

        let messages = queue.pack(100).into_iter().flatten().map(|m| m.message).collect::<Vec<_>>();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.reliability == Reliability::Reliable));
        assert_eq!(messages.iter().map(|m| m.split.map(|s| s.id)).collect::<Vec<_>>(), vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[rstest]
    #[case::invalid_channel(Reliability::ReliableOrdered, 32, 10, SendError::InvalidChannel(32))]
    #[case::too_large(Reliability::ReliableOrdered, 0, 496 * 4 + 1, SendError::MessageTooLarge { len: 496 * 4 + 1, max: 496 * 4 })]
    fn test_enqueue_rejects(#[case] reliability: Reliability, #[case] channel: u8, #[case] len: usize, #[case] expected: SendError) {
        let mut queue = SendQueue::new(548, 32, 4);
        assert_eq!(queue.enqueue_send(reliability, channel, payload(len), None), Err(expected));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_max_len() {
        let mut queue = SendQueue::new(548, 32, 4);
        assert_eq!(queue.enqueue_send(Reliability::ReliableOrdered, 0, payload(496 * 4), None), Ok(4));
    }

    #[test]
    fn test_pack_respects_capacity_and_limit() {
        let mut queue = SendQueue::new(548, 32, 128);
        for _ in 0..10 {
            // 3 bytes header + 200 bytes payload, two fit into 516 bytes
            queue.enqueue_send(Reliability::Unreliable, 0, payload(200), None).unwrap();
        }

        let batches = queue.pack(3);
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 2]);
        assert_eq!(queue.len(), 4);

        let batches = queue.pack(3);
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_front() {
        let mut queue = SendQueue::new(548, 32, 128);
        queue.enqueue_send(Reliability::Reliable, 0, payload(1), None).unwrap();
        let first = queue.pack(1).remove(0);
        queue.enqueue_send(Reliability::Reliable, 0, payload(2), None).unwrap();
        queue.enqueue_send(Reliability::Reliable, 0, payload(3), None).unwrap();

        queue.requeue_front(first);

        let messages = queue.pack(1).remove(0);
        assert_eq!(messages.iter().map(|m| (m.message.payload.len(), m.is_resend)).collect::<Vec<_>>(),
                   vec![(1, true), (2, false), (3, false)]);
    }
}
