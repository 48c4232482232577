use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{WireError, WireResult};

/// The delivery guarantee of a single message. The numeric values are the ids used on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn id(self) -> u8 {
        self.into()
    }

    pub fn from_id(id: u8) -> WireResult<Reliability> {
        Reliability::try_from(id)
            .map_err(|_| WireError::malformed(format!("unknown reliability id {}", id)))
    }

    pub fn is_reliable(self) -> bool {
        use Reliability::*;
        matches!(self, Reliable | ReliableOrdered | ReliableSequenced | ReliableWithAckReceipt | ReliableOrderedWithAckReceipt)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    /// true for messages that carry an order index and an order channel on the wire
    pub fn has_order_info(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    pub fn wants_ack_receipt(self) -> bool {
        use Reliability::*;
        matches!(self, UnreliableWithAckReceipt | ReliableWithAckReceipt | ReliableOrderedWithAckReceipt)
    }

    /// Fragments of a split message are always sent reliably: losing a single unreliable fragment
    ///  would lose the entire message without anybody noticing.
    pub fn for_split(self) -> Reliability {
        match self {
            Reliability::Unreliable => Reliability::Reliable,
            Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
            Reliability::UnreliableWithAckReceipt => Reliability::ReliableWithAckReceipt,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::unreliable(0, Reliability::Unreliable, false, false, false, false)]
    #[case::unreliable_sequenced(1, Reliability::UnreliableSequenced, false, false, true, false)]
    #[case::reliable(2, Reliability::Reliable, true, false, false, false)]
    #[case::reliable_ordered(3, Reliability::ReliableOrdered, true, true, false, false)]
    #[case::reliable_sequenced(4, Reliability::ReliableSequenced, true, false, true, false)]
    #[case::unreliable_with_ack_receipt(5, Reliability::UnreliableWithAckReceipt, false, false, false, true)]
    #[case::reliable_with_ack_receipt(6, Reliability::ReliableWithAckReceipt, true, false, false, true)]
    #[case::reliable_ordered_with_ack_receipt(7, Reliability::ReliableOrderedWithAckReceipt, true, true, false, true)]
    fn test_flags(#[case] id: u8, #[case] expected: Reliability, #[case] reliable: bool, #[case] ordered: bool, #[case] sequenced: bool, #[case] ack_receipt: bool) {
        let reliability = Reliability::from_id(id).unwrap();
        assert_eq!(reliability, expected);
        assert_eq!(reliability.id(), id);
        assert_eq!(reliability.is_reliable(), reliable);
        assert_eq!(reliability.is_ordered(), ordered);
        assert_eq!(reliability.is_sequenced(), sequenced);
        assert_eq!(reliability.wants_ack_receipt(), ack_receipt);
        assert!(!(reliability.is_ordered() && reliability.is_sequenced()));
    }

    #[test]
    fn test_unknown_id() {
        assert!(matches!(Reliability::from_id(8), Err(WireError::MalformedMessage(_))));
    }

    #[rstest]
    #[case::unreliable(Reliability::Unreliable, Reliability::Reliable)]
    #[case::unreliable_sequenced(Reliability::UnreliableSequenced, Reliability::ReliableSequenced)]
    #[case::unreliable_receipt(Reliability::UnreliableWithAckReceipt, Reliability::ReliableWithAckReceipt)]
    #[case::reliable_ordered(Reliability::ReliableOrdered, Reliability::ReliableOrdered)]
    fn test_for_split(#[case] reliability: Reliability, #[case] expected: Reliability) {
        assert_eq!(reliability.for_split(), expected);
        assert!(reliability.for_split().is_reliable());
    }
}
