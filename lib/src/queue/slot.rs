use super::NUM_BUFFER_SLOTS;
use crate::fence::Fence;
use crate::memory::{BufferDescriptor, GraphicBuffer};
use crate::{Rect, ScalingMode, Transform};

use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The slot can be dequeued by the producer. It may or may not hold a
    /// buffer.
    Free,
    /// The producer owns the slot and may write into its buffer.
    Dequeued,
    /// The producer has queued the slot. It is either waiting in the FIFO,
    /// or is the consumer's current buffer.
    Queued,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotState::Free => "FREE",
            SlotState::Dequeued => "DEQUEUED",
            SlotState::Queued => "QUEUED",
        })
    }
}

pub(super) struct BufferSlot<B: GraphicBuffer> {
    /// Buffer currently attached to the slot. Only replaced or removed while
    /// the slot is `Free`, or as part of a reset of the whole table.
    pub(super) buffer: Option<Arc<B>>,
    pub(super) state: SlotState,
    /// Whether the producer has fetched `buffer` since it was last allocated.
    pub(super) request_buffer_called: bool,
    // Metadata copied from the producer at queue time.
    pub(super) crop: Rect,
    pub(super) transform: Transform,
    pub(super) scaling_mode: ScalingMode,
    pub(super) timestamp: i64,
    pub(super) frame_number: u64,
    /// Release fence attached by the consumer, to be passed to the producer
    /// on the next dequeue of this slot.
    pub(super) fence: Option<Fence>,
}

impl<B: GraphicBuffer> BufferSlot<B> {
    fn new() -> Self {
        BufferSlot {
            buffer: None,
            state: SlotState::Free,
            request_buffer_called: false,
            crop: Default::default(),
            transform: Default::default(),
            scaling_mode: Default::default(),
            timestamp: 0,
            frame_number: 0,
            fence: None,
        }
    }

    /// Whether the buffer of this slot, if any, can be used for `request`.
    pub(super) fn satisfies(&self, request: &BufferDescriptor) -> bool {
        self.buffer
            .as_ref()
            .map(|b| b.descriptor().satisfies(request))
            .unwrap_or(false)
    }
}

/// Outcome of the search for a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FreeSlot {
    pub(super) index: usize,
    /// Whether the slot's current buffer can be used as-is.
    pub(super) reusable: bool,
}

/// Fixed array of buffer slots. Only the first `buffer_count` slots of the
/// table are in use at a given time, the other ones remain free and empty.
pub(super) struct SlotTable<B: GraphicBuffer> {
    slots: Vec<BufferSlot<B>>,
}

impl<B: GraphicBuffer> SlotTable<B> {
    pub(super) fn new() -> Self {
        SlotTable {
            slots: (0..NUM_BUFFER_SLOTS).map(|_| BufferSlot::new()).collect(),
        }
    }

    pub(super) fn get(&self, index: usize) -> Option<&BufferSlot<B>> {
        self.slots.get(index)
    }

    pub(super) fn get_mut(&mut self, index: usize) -> Option<&mut BufferSlot<B>> {
        self.slots.get_mut(index)
    }

    /// Iterate over the `buffer_count` slots in use, with their index.
    pub(super) fn iter(
        &self,
        buffer_count: usize,
    ) -> impl Iterator<Item = (usize, &BufferSlot<B>)> {
        self.slots.iter().take(buffer_count).enumerate()
    }

    /// Number of slots in use that are currently in `state`.
    pub(super) fn count(&self, buffer_count: usize, state: SlotState) -> usize {
        self.iter(buffer_count)
            .filter(|(_, s)| s.state == state)
            .count()
    }

    /// Look for a free slot to satisfy `request`.
    ///
    /// The lowest-index free slot holding a compatible buffer is preferred.
    /// Failing that, the lowest-index free slot without a buffer is chosen so
    /// no buffer gets discarded, and only then the lowest-index free slot,
    /// whose buffer will need to be replaced.
    pub(super) fn find_free(
        &self,
        buffer_count: usize,
        request: &BufferDescriptor,
    ) -> Option<FreeSlot> {
        let mut empty = None;
        let mut mismatched = None;

        for (index, slot) in self.iter(buffer_count) {
            if slot.state != SlotState::Free {
                continue;
            }

            if slot.satisfies(request) {
                return Some(FreeSlot {
                    index,
                    reusable: true,
                });
            }

            if slot.buffer.is_none() {
                empty.get_or_insert(index);
            } else {
                mismatched.get_or_insert(index);
            }
        }

        empty.or(mismatched).map(|index| FreeSlot {
            index,
            reusable: false,
        })
    }

    /// Reset every slot of the table to the `Free` state without a buffer,
    /// and return the buffers that were attached to them.
    pub(super) fn release_all(&mut self) -> Vec<Arc<B>> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                let buffer = slot.buffer.take();
                *slot = BufferSlot::new();
                buffer
            })
            .collect()
    }
}
