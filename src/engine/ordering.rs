use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::encapsulated::OrderInfo;
use crate::error::{WireError, WireResult};
use crate::wire::index::Index24;

/// Receive-side state of an ordered channel: messages are delivered strictly in order index
///  order, messages that arrive early are held back until the gap before them is filled.
#[derive(Debug, Default)]
struct OrderedChannel {
    next_expected: Index24,
    buffer: FxHashMap<Index24, Bytes>,
}

/// Receive-side state of a sequenced channel: only messages newer than anything delivered before
///  are delivered, everything else is dropped.
#[derive(Debug, Default)]
struct SequencedChannel {
    next_min: Index24,
}

/// Per-channel ordering and sequencing state for one direction of a peer connection. Ordered and
///  sequenced messages use separate index counters, so a channel's ordered and sequenced state
///  are independent.
#[derive(Debug)]
pub struct OrderingChannels {
    ordered: Vec<OrderedChannel>,
    sequenced: Vec<SequencedChannel>,
    window_size: u32,
}

impl OrderingChannels {
    pub fn new(num_channels: u8, window_size: u32) -> OrderingChannels {
        OrderingChannels {
            ordered: (0..num_channels).map(|_| Default::default()).collect(),
            sequenced: (0..num_channels).map(|_| Default::default()).collect(),
            window_size,
        }
    }

    /// Returns `false` if an ordered message is too far ahead of the next expected index to be
    ///  buffered now. Stale messages and messages on invalid channels are accepted here and
    ///  dealt with by [OrderingChannels::on_ordered].
    pub fn accepts(&self, order: OrderInfo) -> bool {
        let Some(channel) = self.ordered.get(order.channel as usize) else {
            return true;
        };
        let offset = order.index.distance_from(channel.next_expected);
        offset >= Index24::HALF_RANGE || offset < self.window_size
    }

    /// Returns the payloads that become deliverable, in delivery order
    pub fn on_ordered(&mut self, order: OrderInfo, payload: Bytes) -> WireResult<Vec<Bytes>> {
        let channel = self.ordered.get_mut(order.channel as usize)
            .ok_or_else(|| invalid_channel(order.channel))?;

        let offset = order.index.distance_from(channel.next_expected);
        if offset >= Index24::HALF_RANGE {
            trace!("dropping stale ordered message #{} on channel {}", order.index, order.channel);
            return Ok(vec![]);
        }
        if offset > 0 {
            trace!("buffering ordered message #{} on channel {}, waiting for #{}", order.index, order.channel, channel.next_expected);
            channel.buffer.entry(order.index)
                .or_insert(payload);
            return Ok(vec![]);
        }

        let mut result = vec![payload];
        channel.next_expected = channel.next_expected.next();
        while let Some(buffered) = channel.buffer.remove(&channel.next_expected) {
            result.push(buffered);
            channel.next_expected = channel.next_expected.next();
        }
        Ok(result)
    }

    /// Returns `true` if the message should be delivered
    pub fn on_sequenced(&mut self, order: OrderInfo) -> WireResult<bool> {
        let channel = self.sequenced.get_mut(order.channel as usize)
            .ok_or_else(|| invalid_channel(order.channel))?;

        if order.index == channel.next_min || order.index.is_after(channel.next_min) {
            channel.next_min = order.index.next();
            Ok(true)
        }
        else {
            trace!("dropping stale sequenced message #{} on channel {}", order.index, order.channel);
            Ok(false)
        }
    }
}

fn invalid_channel(channel: u8) -> WireError {
    WireError::malformed(format!("order channel {} is out of range", channel))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn order(index: u32) -> OrderInfo {
        OrderInfo { index: Index24::new(index), channel: 1 }
    }

    fn payload(index: u32) -> Bytes {
        Bytes::from(index.to_be_bytes().to_vec())
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::interleaved(vec![2, 0, 3, 1])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::with_duplicates(vec![1, 1, 0, 0, 3, 2, 3, 1])]
    fn test_ordered(#[case] arrival: Vec<u32>) {
        let mut channels = OrderingChannels::new(4, 64);

        let mut delivered = vec![];
        for i in arrival {
            delivered.extend(channels.on_ordered(order(i), payload(i)).unwrap());
        }
        assert_eq!(delivered, (0..4).map(payload).collect::<Vec<_>>());
    }

    #[test]
    fn test_ordered_channels_are_independent() {
        let mut channels = OrderingChannels::new(4, 64);
        assert!(channels.on_ordered(order(1), payload(1)).unwrap().is_empty());
        assert_eq!(channels.on_ordered(OrderInfo { index: Index24::ZERO, channel: 2 }, payload(0)).unwrap(), vec![payload(0)]);
        assert_eq!(channels.on_ordered(order(0), payload(0)).unwrap(), vec![payload(0), payload(1)]);
    }

    #[test]
    fn test_ordered_beyond_window() {
        let mut channels = OrderingChannels::new(4, 8);
        assert!(channels.accepts(order(7)));
        assert!(!channels.accepts(order(8)));
        assert!(!channels.accepts(OrderInfo { index: Index24::new(8), channel: 2 }));
        assert!(channels.accepts(OrderInfo { index: Index24::new(8), channel: 9 }));

        assert!(channels.on_ordered(order(7), payload(7)).unwrap().is_empty());
        let delivered = (0..7)
            .flat_map(|i| channels.on_ordered(order(i), payload(i)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(delivered, (0..8).map(payload).collect::<Vec<_>>());

        // the window moved along with the delivered messages
        assert!(channels.accepts(order(15)));
        assert!(!channels.accepts(order(16)));
        // stale messages are accepted and dropped
        assert!(channels.accepts(order(3)));
        assert!(channels.on_ordered(order(3), payload(3)).unwrap().is_empty());
    }

    #[test]
    fn test_ordered_wrap_around() {
        let mut channels = OrderingChannels::new(4, 8);
        channels.ordered[1].next_expected = Index24::new(Index24::MASK);

        assert!(channels.on_ordered(order(0), payload(0)).unwrap().is_empty());
        assert_eq!(channels.on_ordered(order(Index24::MASK), payload(1)).unwrap(), vec![payload(1), payload(0)]);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![0, 1, 2])]
    #[case::stale(vec![0, 2, 1], vec![0, 2])]
    #[case::gap_first(vec![3, 0, 1, 4], vec![3, 4])]
    #[case::duplicate(vec![0, 0, 1], vec![0, 1])]
    fn test_sequenced(#[case] arrival: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut channels = OrderingChannels::new(4, 64);
        let delivered = arrival.into_iter()
            .filter(|&i| channels.on_sequenced(order(i)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_invalid_channel() {
        let mut channels = OrderingChannels::new(4, 64);
        let order = OrderInfo { index: Index24::ZERO, channel: 4 };
        assert!(channels.on_ordered(order, payload(0)).is_err());
        assert!(channels.on_sequenced(order).is_err());
    }
}
