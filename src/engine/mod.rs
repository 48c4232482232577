//! The reliability engine is the per-peer core of the transport. It turns application messages
//!  into datagrams and received datagrams into application messages, and it takes care of
//!  everything in between:
//!
//! * assigning message indices, order / sequence indices and split ids (see [SendQueue])
//! * keeping sent datagrams with reliable content in an 'in flight' map until they are ACKed,
//!   resending their content on NACK or retransmission timeout
//! * ACKing every received datagram, NACKing gaps in the received sequence numbers
//! * suppressing duplicate datagrams and duplicate reliable messages
//! * reassembling split messages
//! * ordering and sequencing per channel
//!
//! The receive side's bounded structures (duplicate window, ordering window, split assemblies)
//!  are checked before a reliable message is registered as received. A reliable message that
//!  does not fit is left alone, and its datagram is not ACKed so that the sender resends it
//!  after the retransmission timeout, by which time there is usually room for it.
//!
//! The engine does no I/O and has no timers of its own: callers pass in the current time and
//!  call [ReliabilityEngine::on_tick] periodically.

pub mod ordering;
pub mod received_window;
pub mod split_assembly;

use std::cmp::Reverse;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::ack::{AckKind, Acknowledgement};
use crate::batcher::{QueuedMessage, SendQueue};
use crate::config::TransportConfig;
use crate::datagram::CustomDatagram;
use crate::encapsulated::EncapsulatedMessage;
use crate::engine::ordering::OrderingChannels;
use crate::engine::received_window::{Admission, ReceivedWindow};
use crate::engine::split_assembly::SplitAssembler;
use crate::error::{SendError, WireResult};
use crate::reliability::Reliability;
use crate::rtt::RttEstimator;
use crate::wire::index::Index24;

/// A message that passed duplicate suppression, reassembly and ordering, ready for delivery
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub reliability: Reliability,
    pub channel: u8,
    pub payload: Bytes,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReceiptEvent {
    /// every datagram carrying (a fragment of) the message was acknowledged
    Acked(u32),
    /// a datagram carrying an unreliable message was lost
    Lost(u32),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub duplicate_datagrams: u64,
    /// datagrams left unacknowledged because reliable content did not fit into the receive windows
    pub deferred_datagrams: u64,
    pub messages_resent: u64,
    pub messages_delivered: u64,
    pub malformed_messages: u64,
}

/// Bookkeeping for a sent datagram that is waiting for an ACK. Only datagrams with reliable
///  content or unreliable messages with ack receipts are tracked.
#[derive(Debug)]
struct SentDatagramRecord {
    sent_at: Instant,
    /// reliable messages only, these are requeued if the datagram is lost
    messages: Vec<QueuedMessage>,
    /// receipts of unreliable messages in the datagram, these are reported as lost if the
    ///  datagram is lost
    unreliable_receipts: Vec<u32>,
    /// datagrams with resent content yield no RTT samples
    is_resend: bool,
}

pub struct ReliabilityEngine {
    mtu: u16,
    received_window_size: u32,

    send_queue: SendQueue,
    next_send_sequence: Index24,
    in_flight: FxHashMap<Index24, SentDatagramRecord>,
    /// number of fragments per receipt that are not acknowledged yet
    pending_receipts: FxHashMap<u32, usize>,
    next_receipt_id: u32,
    rtt: RttEstimator,

    received_datagrams: ReceivedWindow,
    /// received datagrams that were not ACKed, a duplicate of these is processed once more
    deferred_datagrams: FxHashSet<Index24>,
    next_receive_sequence: Index24,
    received_messages: ReceivedWindow,
    ordering: OrderingChannels,
    splits: SplitAssembler,

    pending_acks: Vec<Index24>,
    pending_nacks: FxHashSet<Index24>,

    stats: EngineStats,
}

impl ReliabilityEngine {
    pub fn new(config: &TransportConfig, mtu: u16) -> ReliabilityEngine {
        ReliabilityEngine {
            mtu,
            received_window_size: config.received_window_size,
            send_queue: SendQueue::new(mtu, config.order_channels, config.max_fragments_per_send),
            next_send_sequence: Index24::ZERO,
            in_flight: Default::default(),
            pending_receipts: Default::default(),
            next_receipt_id: 0,
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto, config.tick_interval),
            received_datagrams: ReceivedWindow::new(config.received_window_size),
            deferred_datagrams: Default::default(),
            next_receive_sequence: Index24::ZERO,
            received_messages: ReceivedWindow::new(config.received_window_size),
            ordering: OrderingChannels::new(config.order_channels, config.ordering_window_size),
            splits: SplitAssembler::new(config.max_split_count, config.max_split_assemblies),
            pending_acks: Vec::new(),
            pending_nacks: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn num_queued(&self) -> usize {
        self.send_queue.len()
    }

    /// Queues a message for sending. If the message's reliability asks for an ack receipt, the
    ///  receipt id is returned.
    pub fn send(&mut self, reliability: Reliability, channel: u8, payload: Bytes) -> Result<Option<u32>, SendError> {
        let receipt = reliability.wants_ack_receipt()
            .then_some(self.next_receipt_id);

        let num_messages = self.send_queue.enqueue_send(reliability, channel, payload, receipt)?;

        if let Some(receipt) = receipt {
            self.next_receipt_id = self.next_receipt_id.wrapping_add(1);
            self.pending_receipts.insert(receipt, num_messages);
        }
        Ok(receipt)
    }

    /// Discards everything that is not sent yet, and stops resending what was sent
    pub fn clear_send_queue(&mut self) {
        self.send_queue.clear();
        self.in_flight.clear();
        self.pending_receipts.clear();
    }

    /// Registers a received datagram for acknowledgement and returns the messages that become
    ///  deliverable through it.
    pub fn on_datagram(&mut self, datagram: CustomDatagram) -> Vec<ReceivedMessage> {
        let sequence_number = datagram.sequence_number;
        self.stats.datagrams_received += 1;

        let is_new = self.received_datagrams.insert_sliding(sequence_number);
        if !is_new && !self.deferred_datagrams.remove(&sequence_number) {
            trace!("duplicate datagram #{}", sequence_number);
            self.stats.duplicate_datagrams += 1;
            self.pending_acks.push(sequence_number);
            return vec![];
        }
        self.pending_nacks.remove(&sequence_number);

        if is_new && (sequence_number == self.next_receive_sequence || sequence_number.is_after(self.next_receive_sequence)) {
            let gap = sequence_number.distance_from(self.next_receive_sequence);
            if gap > 0 {
                debug!("datagrams #{} to #{} are missing", self.next_receive_sequence, sequence_number.plus(Index24::MASK));
            }
            for offs in gap.saturating_sub(self.received_window_size)..gap {
                self.pending_nacks.insert(self.next_receive_sequence.plus(offs));
            }
            self.next_receive_sequence = sequence_number.next();
        }

        let mut result = Vec::new();
        let mut num_deferred = 0;
        for message in datagram.messages {
            match self.on_message(message, &mut result) {
                Ok(true) => {}
                Ok(false) => num_deferred += 1,
                Err(e) => {
                    warn!("dropping malformed message in datagram #{}: {}", sequence_number, e);
                    self.stats.malformed_messages += 1;
                }
            }
        }

        if num_deferred == 0 {
            self.pending_acks.push(sequence_number);
        }
        else {
            debug!("{} reliable messages in datagram #{} do not fit into the receive windows yet - not acknowledging it", num_deferred, sequence_number);
            self.stats.deferred_datagrams += 1;
            self.defer(sequence_number);
        }

        self.stats.messages_delivered += result.len() as u64;
        result
    }

    fn defer(&mut self, sequence_number: Index24) {
        let newest = self.next_receive_sequence;
        let window_size = self.received_window_size;
        self.deferred_datagrams.retain(|s| newest.distance_from(*s) <= window_size);
        self.deferred_datagrams.insert(sequence_number);
    }

    /// Returns `false` if the message is reliable and does not fit into the receive windows yet.
    ///  It is not registered as received in that case.
    fn on_message(&mut self, message: EncapsulatedMessage, result: &mut Vec<ReceivedMessage>) -> WireResult<bool> {
        if let Some(message_index) = message.message_index {
            match self.received_messages.check(message_index) {
                Admission::New => {}
                Admission::Duplicate => {
                    trace!("dropping duplicate message #{}", message_index);
                    return Ok(true);
                }
                Admission::BeyondWindow => {
                    trace!("message #{} is beyond the duplicate detection window", message_index);
                    return Ok(false);
                }
            }

            if !self.splits.accepts(&message) {
                trace!("no room for reassembling message #{}", message_index);
                return Ok(false);
            }
            if let Some(order) = message.order {
                if message.reliability.is_ordered() && !self.ordering.accepts(order) {
                    trace!("message #{} with order index #{} is beyond the ordering window of channel {}", message_index, order.index, order.channel);
                    return Ok(false);
                }
            }

            self.received_messages.insert(message_index);
        }

        let Some(message) = self.splits.on_fragment(message)? else {
            return Ok(true);
        };

        let reliability = message.reliability;
        let channel = message.order_channel();
        match message.order {
            Some(order) if reliability.is_ordered() => {
                for payload in self.ordering.on_ordered(order, message.payload)? {
                    result.push(ReceivedMessage { reliability, channel, payload });
                }
            }
            Some(order) if reliability.is_sequenced() => {
                if self.ordering.on_sequenced(order)? {
                    result.push(ReceivedMessage { reliability, channel, payload: message.payload });
                }
            }
            _ => {
                result.push(ReceivedMessage { reliability, channel, payload: message.payload });
            }
        }
        Ok(true)
    }

    pub fn on_acknowledgement(&mut self, now: Instant, ack: Acknowledgement) -> Vec<ReceiptEvent> {
        let mut receipts = Vec::new();

        match ack.kind {
            AckKind::Ack => {
                for sequence_number in ack.indices() {
                    if let Some(record) = self.in_flight.remove(&sequence_number) {
                        trace!("datagram #{} was acknowledged", sequence_number);
                        self.on_delivered(now, record, &mut receipts);
                    }
                }
            }
            AckKind::Nack => {
                let lost = ack.indices()
                    .filter(|s| self.in_flight.contains_key(s))
                    .collect::<Vec<_>>();
                if !lost.is_empty() {
                    debug!("peer reported {} sent datagrams as missing", lost.len());
                }
                self.resend(lost, &mut receipts);
            }
        }
        receipts
    }

    fn on_delivered(&mut self, now: Instant, record: SentDatagramRecord, receipts: &mut Vec<ReceiptEvent>) {
        if !record.is_resend {
            self.rtt.on_sample(now.saturating_duration_since(record.sent_at));
        }

        for receipt in record.messages.iter().filter_map(|m| m.receipt) {
            if let Some(remaining) = self.pending_receipts.get_mut(&receipt) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.pending_receipts.remove(&receipt);
                    receipts.push(ReceiptEvent::Acked(receipt));
                }
            }
        }
        for receipt in record.unreliable_receipts {
            if self.pending_receipts.remove(&receipt).is_some() {
                receipts.push(ReceiptEvent::Acked(receipt));
            }
        }
    }

    /// Requeues the reliable content of lost datagrams, oldest first, ahead of anything not
    ///  sent yet
    fn resend(&mut self, mut lost: Vec<Index24>, receipts: &mut Vec<ReceiptEvent>) {
        let newest = self.next_send_sequence;
        lost.sort_by_key(|s| Reverse(newest.distance_from(*s)));

        let mut requeued = Vec::new();
        for sequence_number in lost {
            let Some(record) = self.in_flight.remove(&sequence_number) else {
                continue;
            };
            trace!("resending {} messages from datagram #{}", record.messages.len(), sequence_number);
            self.stats.messages_resent += record.messages.len() as u64;
            requeued.extend(record.messages);

            for receipt in record.unreliable_receipts {
                if self.pending_receipts.remove(&receipt).is_some() {
                    receipts.push(ReceiptEvent::Lost(receipt));
                }
            }
        }
        self.send_queue.requeue_front(requeued);
    }

    /// Treats datagrams that were not acknowledged within the retransmission timeout as lost
    pub fn on_tick(&mut self, now: Instant) -> Vec<ReceiptEvent> {
        let rto = self.rtt.rto();
        let expired = self.in_flight.iter()
            .filter(|(_, record)| now.saturating_duration_since(record.sent_at) >= rto)
            .map(|(&sequence_number, _)| sequence_number)
            .collect::<Vec<_>>();

        let mut receipts = Vec::new();
        if !expired.is_empty() {
            debug!("retransmission timeout of {:?} expired for {} datagrams", rto, expired.len());
            self.rtt.on_timeout();
            self.resend(expired, &mut receipts);
        }
        receipts
    }

    /// Packs queued messages into datagrams, assigning sequence numbers and registering the
    ///  datagrams for resending where necessary.
    pub fn flush_datagrams(&mut self, now: Instant, max_datagrams: usize) -> Vec<CustomDatagram> {
        let mut result = Vec::new();

        for batch in self.send_queue.pack(max_datagrams) {
            let sequence_number = self.next_send_sequence.post_increment();

            let mut messages = Vec::with_capacity(batch.len());
            let mut record = SentDatagramRecord {
                sent_at: now,
                messages: Vec::new(),
                unreliable_receipts: Vec::new(),
                is_resend: false,
            };
            for queued in batch {
                messages.push(queued.message.clone());
                record.is_resend |= queued.is_resend;

                if queued.message.reliability.is_reliable() {
                    record.messages.push(queued);
                }
                else if let Some(receipt) = queued.receipt {
                    record.unreliable_receipts.push(receipt);
                }
            }

            if !record.messages.is_empty() || !record.unreliable_receipts.is_empty() {
                self.in_flight.insert(sequence_number, record);
            }

            self.stats.datagrams_sent += 1;
            result.push(CustomDatagram { sequence_number, messages });
        }
        result
    }

    /// Produces everything that is ready to go on the wire: pending ACKs, pending NACKs, and
    ///  datagrams with queued messages
    pub fn flush_outgoing(&mut self, now: Instant, max_datagrams: usize) -> Vec<Bytes> {
        let max_len = SendQueue::max_datagram_len(self.mtu);
        let mut result = Vec::new();

        if !self.pending_acks.is_empty() {
            for ack in Acknowledgement::build(AckKind::Ack, self.pending_acks.drain(..), max_len) {
                result.push(ack.encode());
            }
        }
        if !self.pending_nacks.is_empty() {
            for nack in Acknowledgement::build(AckKind::Nack, self.pending_nacks.drain(), max_len) {
                result.push(nack.encode());
            }
        }

        for datagram in self.flush_datagrams(now, max_datagrams) {
            trace!("sending datagram #{} with {} messages", datagram.sequence_number, datagram.messages.len());
            result.push(datagram.encode());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::wire::codec::RakBuf;
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            initial_rto: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn engine(mtu: u16) -> ReliabilityEngine {
        ReliabilityEngine::new(&config(), mtu)
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn ack(kind: AckKind, indices: &[u32]) -> Acknowledgement {
        Acknowledgement::build(kind, indices.iter().map(|&i| Index24::new(i)), 1000).remove(0)
    }

    fn sequence_numbers(datagrams: &[CustomDatagram]) -> Vec<u32> {
        datagrams.iter().map(|d| d.sequence_number.to_raw()).collect()
    }

    #[test]
    fn test_split_scenario_mtu_548() {
        let now = Instant::now();
        let mut sender = engine(548);
        let mut receiver = engine(548);

        let data = payload(2000);
        assert_eq!(sender.send(Reliability::ReliableOrdered, 0, data.clone()), Ok(None));

        let datagrams = sender.flush_datagrams(now, 1000);
        let fragments = datagrams.iter()
            .flat_map(|d| d.messages.iter())
            .collect::<Vec<_>>();
        assert!(fragments.len() >= 4);
        for f in &fragments {
            let split = f.split.unwrap();
            assert_eq!(split.id, fragments[0].split.unwrap().id);
            assert_eq!(split.count as usize, fragments.len());
            assert_eq!(f.order, fragments[0].order);
            assert_eq!(f.order_channel(), 0);
        }
        for d in &datagrams {
            assert!(d.encode().len() <= 548 - 28);
        }

        assert_eq!(datagrams.len(), 5);
        let mut delivered = vec![];
        for i in [3, 0, 4, 2, 1] {
            delivered.extend(receiver.on_datagram(datagrams[i].clone()));
        }
        assert_eq!(delivered, vec![ReceivedMessage { reliability: Reliability::ReliableOrdered, channel: 0, payload: data }]);
    }

    #[test]
    fn test_ordering_across_datagrams() {
        let now = Instant::now();
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        let mut datagrams = vec![];
        for i in 0..4u8 {
            sender.send(Reliability::ReliableOrdered, 3, Bytes::from(vec![i])).unwrap();
            datagrams.extend(sender.flush_datagrams(now, 10));
        }

        let mut delivered = vec![];
        for i in [2, 0, 3, 1] {
            delivered.extend(receiver.on_datagram(datagrams[i].clone()));
        }
        assert_eq!(delivered.iter().map(|m| m.payload[0]).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(delivered.iter().all(|m| m.channel == 3));
    }

    #[test]
    fn test_sequenced_drops_stale() {
        let now = Instant::now();
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        let mut datagrams = vec![];
        for i in 0..3u8 {
            sender.send(Reliability::UnreliableSequenced, 0, Bytes::from(vec![i])).unwrap();
            datagrams.extend(sender.flush_datagrams(now, 10));
        }

        let mut delivered = vec![];
        for i in [0, 2, 1] {
            delivered.extend(receiver.on_datagram(datagrams[i].clone()));
        }
        assert_eq!(delivered.iter().map(|m| m.payload[0]).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_duplicate_suppression() {
        let now = Instant::now();
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        sender.send(Reliability::Reliable, 0, payload(10)).unwrap();
        let datagram = sender.flush_datagrams(now, 10).remove(0);

        // same datagram twice
        assert_eq!(receiver.on_datagram(datagram.clone()).len(), 1);
        assert!(receiver.on_datagram(datagram.clone()).is_empty());

        // same message in a different datagram
        let resent = CustomDatagram { sequence_number: Index24::new(1), messages: datagram.messages };
        assert!(receiver.on_datagram(resent).is_empty());

        assert_eq!(receiver.stats().duplicate_datagrams, 1);
        assert_eq!(receiver.stats().messages_delivered, 1);
        assert_eq!(receiver.pending_acks, vec![Index24::ZERO, Index24::ZERO, Index24::new(1)]);
    }

    #[test]
    fn test_retransmission_timeout_resends_once() {
        let now = Instant::now();
        let mut sender = engine(1464);

        sender.send(Reliability::Reliable, 0, payload(10)).unwrap();
        sender.send(Reliability::Unreliable, 0, payload(5)).unwrap();
        let first = sender.flush_datagrams(now, 10);
        assert_eq!(sequence_numbers(&first), vec![0]);
        assert_eq!(sender.num_in_flight(), 1);

        assert!(sender.on_tick(now + Duration::from_millis(499)).is_empty());
        assert!(sender.flush_datagrams(now + Duration::from_millis(499), 10).is_empty());

        sender.on_tick(now + Duration::from_millis(500));
        let resent = sender.flush_datagrams(now + Duration::from_millis(500), 10);
        assert_eq!(sequence_numbers(&resent), vec![1]);
        assert_eq!(resent[0].messages.len(), 1);
        assert_eq!(resent[0].messages[0], first[0].messages[0]);
        assert_eq!(sender.stats().messages_resent, 1);
        assert_eq!(sender.rto(), Duration::from_secs(1));

        // no second resend before the (doubled) timeout expires again
        sender.on_tick(now + Duration::from_millis(600));
        assert!(sender.flush_datagrams(now + Duration::from_millis(600), 10).is_empty());
    }

    #[test]
    fn test_nack_resends_with_new_sequence_number() {
        let now = Instant::now();
        let mut sender = engine(1464);

        for i in 0..3u8 {
            sender.send(Reliability::Reliable, 0, Bytes::from(vec![i])).unwrap();
            sender.flush_datagrams(now, 10);
        }
        sender.send(Reliability::Reliable, 0, Bytes::from(vec![3])).unwrap();

        assert!(sender.on_acknowledgement(now, ack(AckKind::Nack, &[2, 0, 17])).is_empty());
        let resent = sender.flush_datagrams(now, 10);
        assert_eq!(sequence_numbers(&resent), vec![3]);
        assert_eq!(resent[0].messages.iter().map(|m| m.payload[0]).collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(resent[0].messages.iter().map(|m| m.message_index.unwrap().to_raw()).collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(sender.num_in_flight(), 2);
    }

    #[test]
    fn test_ack_takes_rtt_sample() {
        let now = Instant::now();
        let mut sender = engine(1464);

        sender.send(Reliability::Reliable, 0, payload(1)).unwrap();
        sender.flush_datagrams(now, 10);
        sender.on_acknowledgement(now + Duration::from_millis(100), ack(AckKind::Ack, &[0]));

        assert_eq!(sender.num_in_flight(), 0);
        assert_eq!(sender.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(sender.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_ack_of_resent_datagram_takes_no_rtt_sample() {
        let now = Instant::now();
        let mut sender = engine(1464);

        sender.send(Reliability::Reliable, 0, payload(1)).unwrap();
        sender.flush_datagrams(now, 10);
        sender.on_acknowledgement(now, ack(AckKind::Nack, &[0]));
        sender.flush_datagrams(now, 10);
        sender.on_acknowledgement(now + Duration::from_millis(100), ack(AckKind::Ack, &[1]));

        assert_eq!(sender.num_in_flight(), 0);
        assert_eq!(sender.srtt(), None);
    }

    #[test]
    fn test_unreliable_is_not_tracked() {
        let now = Instant::now();
        let mut sender = engine(1464);

        sender.send(Reliability::Unreliable, 0, payload(10)).unwrap();
        sender.send(Reliability::Unreliable, 0, payload(10)).unwrap();
        assert_eq!(sender.flush_datagrams(now, 10).len(), 1);
        assert_eq!(sender.num_in_flight(), 0);

        sender.on_tick(now + Duration::from_secs(60));
        assert!(sender.flush_datagrams(now + Duration::from_secs(60), 10).is_empty());
    }

    #[test]
    fn test_receipt_for_split_message() {
        let now = Instant::now();
        let mut sender = engine(548);

        let receipt = sender.send(Reliability::ReliableWithAckReceipt, 0, payload(1200)).unwrap().unwrap();
        let datagrams = sender.flush_datagrams(now, 10);
        assert_eq!(sequence_numbers(&datagrams), vec![0, 1, 2]);

        assert!(sender.on_acknowledgement(now, ack(AckKind::Ack, &[0, 2])).is_empty());
        assert_eq!(sender.on_acknowledgement(now, ack(AckKind::Ack, &[1])), vec![ReceiptEvent::Acked(receipt)]);
        assert!(sender.on_acknowledgement(now, ack(AckKind::Ack, &[1])).is_empty());
    }

    #[rstest]
    #[case::ack(AckKind::Ack, ReceiptEvent::Acked(0))]
    #[case::nack(AckKind::Nack, ReceiptEvent::Lost(0))]
    fn test_unreliable_receipt(#[case] kind: AckKind, #[case] expected: ReceiptEvent) {
        let now = Instant::now();
        let mut sender = engine(1464);

        assert_eq!(sender.send(Reliability::UnreliableWithAckReceipt, 0, payload(10)), Ok(Some(0)));
        sender.flush_datagrams(now, 10);
        assert_eq!(sender.num_in_flight(), 1);

        assert_eq!(sender.on_acknowledgement(now, ack(kind, &[0])), vec![expected]);
        assert_eq!(sender.num_in_flight(), 0);
        // unreliable content is never resent
        assert!(sender.flush_datagrams(now, 10).is_empty());
    }

    #[test]
    fn test_unreliable_receipt_lost_on_timeout() {
        let now = Instant::now();
        let mut sender = engine(1464);

        sender.send(Reliability::UnreliableWithAckReceipt, 0, payload(10)).unwrap();
        sender.flush_datagrams(now, 10);
        assert_eq!(sender.on_tick(now + Duration::from_secs(1)), vec![ReceiptEvent::Lost(0)]);
    }

    #[test]
    fn test_gap_is_nacked() {
        let now = Instant::now();
        let mut receiver = engine(1464);

        let datagram = |seq: u32| CustomDatagram { sequence_number: Index24::new(seq), messages: vec![] };
        receiver.on_datagram(datagram(0));
        receiver.on_datagram(datagram(3));
        receiver.on_datagram(datagram(1));

        let packets = receiver.flush_outgoing(now, 10);
        assert_eq!(packets.len(), 2);

        let acks = Acknowledgement::deser(&mut packets[0].clone()).unwrap();
        assert_eq!(acks.kind, AckKind::Ack);
        assert_eq!(acks.indices().map(|i| i.to_raw()).collect::<Vec<_>>(), vec![0, 1, 3]);

        let nacks = Acknowledgement::deser(&mut packets[1].clone()).unwrap();
        assert_eq!(nacks.kind, AckKind::Nack);
        assert_eq!(nacks.indices().map(|i| i.to_raw()).collect::<Vec<_>>(), vec![2]);

        assert!(receiver.flush_outgoing(now, 10).is_empty());
    }

    #[test]
    fn test_flush_outgoing_respects_mtu_and_limit() {
        let now = Instant::now();
        let mut sender = engine(576);

        for _ in 0..20 {
            sender.send(Reliability::ReliableOrdered, 0, payload(300)).unwrap();
        }
        let packets = sender.flush_outgoing(now, 5);
        assert_eq!(packets.len(), 5);
        for p in &packets {
            assert!(p.len() <= 576 - 28);
        }
        assert_eq!(sender.num_queued(), 15);
    }

    /// Passes datagrams from sender to receiver and acknowledgements back, with a retransmission
    ///  timeout expiring after each round, until the sender has nothing left in flight. `is_lost`
    ///  decides which datagrams the network drops, by round and content.
    fn transfer(sender: &mut ReliabilityEngine, receiver: &mut ReliabilityEngine, is_lost: impl Fn(usize, &CustomDatagram) -> bool) -> Vec<ReceivedMessage> {
        let mut now = Instant::now();
        let mut delivered = vec![];
        for round in 0..50 {
            for packet in sender.flush_outgoing(now, 1000) {
                let datagram = CustomDatagram::deser(&mut packet.clone()).unwrap();
                if !is_lost(round, &datagram) {
                    delivered.extend(receiver.on_datagram(datagram));
                }
            }
            for packet in receiver.flush_outgoing(now, 1000) {
                let ack = Acknowledgement::deser(&mut packet.clone()).unwrap();
                sender.on_acknowledgement(now, ack);
            }
            if sender.num_in_flight() == 0 && sender.num_queued() == 0 {
                return delivered;
            }
            now += Duration::from_secs(20);
            sender.on_tick(now);
        }
        panic!("transfer did not complete");
    }

    fn numbered(i: u32) -> Bytes {
        Bytes::from(i.to_be_bytes().to_vec())
    }

    #[test]
    fn test_lossy_transfer_recovers() {
        let mut sender = engine(548);
        let mut receiver = engine(548);

        let mut expected = vec![];
        for i in 0..20u8 {
            let data = Bytes::from(vec![i; 100 + 50 * i as usize]);
            sender.send(Reliability::ReliableOrdered, 1, data.clone()).unwrap();
            expected.push(data);
        }

        // drop every third datagram
        let delivered = transfer(&mut sender, &mut receiver, |round, d| (d.sequence_number.to_raw() as usize + round) % 3 == 0);
        assert_eq!(delivered.into_iter().map(|m| m.payload).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_ordered_burst_beyond_ordering_window() {
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        let num_messages = config().ordering_window_size + 153;
        for i in 0..num_messages {
            sender.send(Reliability::ReliableOrdered, 0, numbered(i)).unwrap();
        }

        let delivered = transfer(&mut sender, &mut receiver, |round, d| round == 0 && d.sequence_number == Index24::ZERO);
        assert_eq!(delivered.into_iter().map(|m| m.payload).collect::<Vec<_>>(), (0..num_messages).map(numbered).collect::<Vec<_>>());
        assert!(receiver.stats().deferred_datagrams > 0);
    }

    #[test]
    fn test_reliable_burst_beyond_duplicate_window() {
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        let num_messages = config().received_window_size + 152;
        for i in 0..num_messages {
            sender.send(Reliability::Reliable, 0, numbered(i)).unwrap();
        }

        let delivered = transfer(&mut sender, &mut receiver, |round, d| round == 0 && d.sequence_number == Index24::ZERO);
        let mut payloads = delivered.into_iter().map(|m| m.payload).collect::<Vec<_>>();
        payloads.sort();
        assert_eq!(payloads, (0..num_messages).map(numbered).collect::<Vec<_>>());
        assert!(receiver.stats().deferred_datagrams > 0);
    }

    #[test]
    fn test_more_concurrent_splits_than_assemblies() {
        let mut sender = engine(1464);
        let mut receiver = engine(1464);

        let num_messages = config().max_split_assemblies + 6;
        for i in 0..num_messages {
            sender.send(Reliability::ReliableOrdered, 0, Bytes::from(vec![i as u8; 1500])).unwrap();
        }

        // every message's second fragment is lost the first time
        let delivered = transfer(&mut sender, &mut receiver, |round, d| {
            round == 0 && d.messages.iter().any(|m| m.split.map_or(false, |s| s.index == 1))
        });
        assert_eq!(
            delivered.into_iter().map(|m| m.payload).collect::<Vec<_>>(),
            (0..num_messages).map(|i| Bytes::from(vec![i as u8; 1500])).collect::<Vec<_>>(),
        );
        assert_eq!(receiver.splits.num_pending(), 0);
        assert_eq!(receiver.stats().malformed_messages, 0);
        assert!(receiver.stats().deferred_datagrams > 0);
    }

    #[test]
    fn test_message_beyond_duplicate_window_is_not_acknowledged() {
        let now = Instant::now();
        let config = TransportConfig { received_window_size: 4, ..config() };
        let mut sender = ReliabilityEngine::new(&config, 1464);
        let mut receiver = ReliabilityEngine::new(&config, 1464);

        let mut datagrams = vec![];
        for i in 0..5u8 {
            sender.send(Reliability::Reliable, 0, Bytes::from(vec![i])).unwrap();
            datagrams.extend(sender.flush_datagrams(now, 10));
        }
        let payloads = |messages: Vec<ReceivedMessage>| messages.into_iter().map(|m| m.payload[0]).collect::<Vec<_>>();
        let acknowledge = |sender: &mut ReliabilityEngine, receiver: &mut ReliabilityEngine, now: Instant| {
            for packet in receiver.flush_outgoing(now, 10) {
                sender.on_acknowledgement(now, Acknowledgement::deser(&mut packet.clone()).unwrap());
            }
        };

        // datagram #0 is lost, so message #4 is beyond the window
        let mut delivered = vec![];
        for d in &datagrams[1..] {
            delivered.extend(payloads(receiver.on_datagram(d.clone())));
        }
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(receiver.stats().deferred_datagrams, 1);
        assert_eq!(receiver.pending_acks, vec![Index24::new(1), Index24::new(2), Index24::new(3)]);

        // a duplicate of the unacknowledged datagram is processed once more
        assert!(receiver.on_datagram(datagrams[4].clone()).is_empty());
        assert_eq!(receiver.stats().duplicate_datagrams, 0);
        assert_eq!(receiver.stats().deferred_datagrams, 2);

        // the NACK for #0 brings message #0, which moves the window
        acknowledge(&mut sender, &mut receiver, now);
        assert_eq!(sender.num_in_flight(), 1);
        for d in sender.flush_datagrams(now, 10) {
            assert_eq!(payloads(receiver.on_datagram(d)), vec![0]);
        }
        acknowledge(&mut sender, &mut receiver, now);

        // message #4 is resent after the retransmission timeout and accepted now
        let later = now + Duration::from_secs(1);
        sender.on_tick(later);
        for d in sender.flush_datagrams(later, 10) {
            assert_eq!(payloads(receiver.on_datagram(d)), vec![4]);
        }
        acknowledge(&mut sender, &mut receiver, later);
        assert_eq!(sender.num_in_flight(), 0);
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let mut sender = engine(1464);
        assert_eq!(sender.send(Reliability::ReliableOrdered, 32, payload(1)), Err(SendError::InvalidChannel(32)));
    }

    #[test]
    fn test_malformed_message_is_counted() {
        let mut receiver = engine(1464);
        let datagram = CustomDatagram {
            sequence_number: Index24::ZERO,
            messages: vec![
                EncapsulatedMessage {
                    reliability: Reliability::ReliableOrdered,
                    message_index: Some(Index24::ZERO),
                    order: Some(crate::encapsulated::OrderInfo { index: Index24::ZERO, channel: 200 }),
                    split: None,
                    payload: payload(3),
                },
                EncapsulatedMessage {
                    reliability: Reliability::Unreliable,
                    message_index: None,
                    order: None,
                    split: None,
                    payload: payload(4),
                },
            ],
        };
        let delivered = receiver.on_datagram(datagram);
        assert_eq!(delivered.len(), 1);
        assert_eq!(receiver.stats().malformed_messages, 1);

        let mut id = receiver.flush_outgoing(Instant::now(), 10).remove(0);
        assert_eq!(id.read_u8().unwrap(), crate::ack::ID_ACK);
    }
}
