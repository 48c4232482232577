use std::collections::VecDeque;

use crate::wire::index::Index24;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    New,
    Duplicate,
    /// too far ahead of the lowest index not received yet
    BeyondWindow,
}

/// A bounded set of received indices, used to suppress duplicate datagrams and duplicate
///  reliable messages.
///
/// Everything before `base` was received. The window covers `capacity` indices starting at
///  `base`, and it moves forward only as the gap at `base` is filled - except for
///  [ReceivedWindow::insert_sliding], which is for sequence numbers that are never resent.
#[derive(Debug)]
pub struct ReceivedWindow {
    base: Index24,
    /// 'received' flags for `base`, `base+1`, ...; the first entry is always `false`
    received: VecDeque<bool>,
    capacity: u32,
}

impl ReceivedWindow {
    pub fn new(capacity: u32) -> ReceivedWindow {
        ReceivedWindow {
            base: Index24::ZERO,
            received: VecDeque::new(),
            capacity,
        }
    }

    pub fn check(&self, index: Index24) -> Admission {
        let offset = index.distance_from(self.base);
        if offset >= Index24::HALF_RANGE {
            return Admission::Duplicate;
        }
        if offset >= self.capacity {
            return Admission::BeyondWindow;
        }
        if self.received.get(offset as usize).copied().unwrap_or(false) {
            Admission::Duplicate
        }
        else {
            Admission::New
        }
    }

    /// Registers an index as received if it is new and inside the window
    pub fn insert(&mut self, index: Index24) -> Admission {
        let admission = self.check(index);
        if admission == Admission::New {
            self.mark(index.distance_from(self.base) as usize);
        }
        admission
    }

    /// Registers an index as received, returning `false` if it was received before. An index
    ///  beyond the window moves the window forward, and the indices that fall out of it count
    ///  as received whether they arrived or not.
    pub fn insert_sliding(&mut self, index: Index24) -> bool {
        let offset = index.distance_from(self.base);
        if offset < Index24::HALF_RANGE && offset >= self.capacity {
            let shift = offset - self.capacity + 1;
            if shift as usize >= self.received.len() {
                self.received.clear();
            }
            else {
                self.received.drain(..shift as usize);
            }
            self.base = self.base.plus(shift);
        }

        self.insert(index) == Admission::New
    }

    fn mark(&mut self, offset: usize) {
        if self.received.len() <= offset {
            self.received.resize(offset + 1, false);
        }
        self.received[offset] = true;

        while self.received.front() == Some(&true) {
            self.received.pop_front();
            self.base = self.base.next();
        }
    }
}
