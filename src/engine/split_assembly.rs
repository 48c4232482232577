use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::encapsulated::{EncapsulatedMessage, SplitInfo};
use crate::error::{WireError, WireResult};

#[derive(Debug)]
struct SplitAssembly {
    count: u32,
    is_reliable: bool,
    /// fragment #0 without its payload, providing metadata for the reassembled message
    head: Option<EncapsulatedMessage>,
    fragments: Vec<Option<Bytes>>,
    num_received: u32,
}

impl SplitAssembly {
    fn new(count: u32, is_reliable: bool) -> SplitAssembly {
        SplitAssembly {
            count,
            is_reliable,
            head: None,
            fragments: vec![None; count as usize],
            num_received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.count
    }
}

/// Reassembly of split messages, keyed by split id
#[derive(Debug)]
pub struct SplitAssembler {
    assemblies: FxHashMap<u16, SplitAssembly>,
    max_split_count: u32,
    max_assemblies: usize,
}

impl SplitAssembler {
    pub fn new(max_split_count: u32, max_assemblies: usize) -> SplitAssembler {
        SplitAssembler {
            assemblies: Default::default(),
            max_split_count,
            max_assemblies,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.assemblies.len()
    }

    /// Returns `false` if a reliable fragment would start a new assembly while the limit is
    ///  reached and there is no unreliable assembly to discard. Such a fragment must be left for
    ///  the sender to resend later.
    pub fn accepts(&self, message: &EncapsulatedMessage) -> bool {
        let Some(split) = message.split else {
            return true;
        };
        if !message.reliability.is_reliable()
            || self.assemblies.contains_key(&split.id)
            || self.assemblies.len() < self.max_assemblies
        {
            return true;
        }
        self.assemblies.values().any(|a| !a.is_reliable)
    }

    /// Adds a fragment, returning the reassembled message once all of its fragments arrived.
    ///  The reassembled message carries fragment #0's reliability, message index and order info.
    ///
    /// Messages without split info are returned as they are.
    pub fn on_fragment(&mut self, message: EncapsulatedMessage) -> WireResult<Option<EncapsulatedMessage>> {
        let Some(split) = message.split else {
            return Ok(Some(message));
        };

        if split.index >= split.count {
            return Err(WireError::malformed(format!("fragment index {} of split #{} is out of range", split.index, split.id)));
        }
        if split.count > self.max_split_count {
            return Err(WireError::malformed(format!("split message with {} fragments exceeds the limit of {}", split.count, self.max_split_count)));
        }

        if !self.assemblies.contains_key(&split.id) {
            self.make_room(split.id)?;
            self.assemblies.insert(split.id, SplitAssembly::new(split.count, message.reliability.is_reliable()));
        }

        let complete = {
            let Some(assembly) = self.assemblies.get_mut(&split.id) else {
                return Ok(None);
            };
            if assembly.count != split.count {
                return Err(WireError::malformed(format!("split #{} announced {} fragments, previously {}", split.id, split.count, assembly.count)));
            }

            let slot = &mut assembly.fragments[split.index as usize];
            if slot.is_some() {
                trace!("ignoring duplicate fragment {} of split #{}", split.index, split.id);
                return Ok(None);
            }

            let EncapsulatedMessage { reliability, message_index, order, payload, .. } = message;
            *slot = Some(payload);
            assembly.num_received += 1;
            if split.index == 0 {
                assembly.head = Some(EncapsulatedMessage {
                    reliability,
                    message_index,
                    order,
                    split: None,
                    payload: Bytes::new(),
                });
            }
            assembly.is_complete()
        };

        if !complete {
            return Ok(None);
        }

        let Some(assembly) = self.assemblies.remove(&split.id) else {
            return Ok(None);
        };
        Ok(Self::reassemble(split, assembly))
    }

    fn reassemble(split: SplitInfo, assembly: SplitAssembly) -> Option<EncapsulatedMessage> {
        let len = assembly.fragments.iter()
            .flatten()
            .map(|f| f.len())
            .sum();

        let mut payload = BytesMut::with_capacity(len);
        for fragment in assembly.fragments.iter().flatten() {
            payload.extend_from_slice(fragment);
        }

        trace!("reassembled split #{} from {} fragments, {} bytes", split.id, split.count, len);

        let mut result = assembly.head?;
        result.payload = payload.freeze();
        Some(result)
    }

    fn make_room(&mut self, split_id: u16) -> WireResult<()> {
        if self.assemblies.len() < self.max_assemblies {
            return Ok(());
        }

        let unreliable = self.assemblies.iter()
            .filter(|(_, a)| !a.is_reliable)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in unreliable {
            if self.assemblies.len() < self.max_assemblies {
                break;
            }
            debug!("discarding incomplete unreliable split #{} to make room for split #{}", id, split_id);
            self.assemblies.remove(&id);
        }

        if self.assemblies.len() < self.max_assemblies {
            Ok(())
        }
        else {
            Err(WireError::malformed(format!("too many concurrent split messages, dropping fragment of split #{}", split_id)))
        }
    }
}
