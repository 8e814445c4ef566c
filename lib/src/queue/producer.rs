//! Operations performed by the producer, i.e. the client that renders into
//! the buffers.
//!
//! The typical producer loop looks as follows:
//!
//! ```
//! # use bufferqueue::memory::{BufferUsage, HeapAllocator};
//! # use bufferqueue::{BufferQueue, Consumer, DequeueFlags, NativeWindowApi, PixelFormat};
//! # use bufferqueue::{Producer, QueueBufferInput, QueueConfig};
//! let queue = BufferQueue::new(HeapAllocator::new(), QueueConfig::new()).unwrap();
//! queue.connect(NativeWindowApi::Cpu).unwrap();
//!
//! let dequeued = queue
//!     .dequeue(64, 64, PixelFormat::RGBA_8888, BufferUsage::SW_WRITE_OFTEN)
//!     .unwrap();
//! assert!(dequeued.flags.contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
//! let buffer = queue.request_buffer(dequeued.slot).unwrap();
//! buffer.lock_pixels().fill(0xff);
//! queue.queue(dequeued.slot, QueueBufferInput::new(1_000)).unwrap();
//!
//! let frame = queue.acquire_next().unwrap().unwrap();
//! assert_eq!(frame.timestamp, 1_000);
//! ```
use super::slot::FreeSlot;
use super::{BufferQueue, QueueBufferOutput, QueueError, QueueResult, SlotState, NUM_BUFFER_SLOTS};
use crate::fence::{Fence, SyncMode};
use crate::memory::{BufferAllocator, BufferDescriptor, BufferUsage, GraphicBuffer};
use crate::{NativeWindowApi, PixelFormat, Rect, ScalingMode, Transform};

use std::sync::Arc;

use bitflags::bitflags;
use enumn::N;
use log::{debug, error, warn};

bitflags! {
    /// Extra information returned by `dequeue`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        /// A new buffer has been allocated for the slot. The producer must
        /// call `request_buffer` before queuing it.
        const BUFFER_NEEDS_REALLOCATION = 0x1;
        /// All the buffers of the queue have been freed. The producer must
        /// drop every buffer reference it cached.
        const RELEASE_ALL_BUFFERS = 0x2;
    }
}

/// Result of a successful `dequeue`.
#[derive(Debug)]
pub struct DequeueOutput {
    /// Index of the slot now owned by the producer.
    pub slot: usize,
    /// Fence to wait on before writing into the buffer, in fence-gated
    /// queues only.
    pub fence: Option<Fence>,
    pub flags: DequeueFlags,
}

/// Metadata attached to a frame by `queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueBufferInput {
    pub timestamp: i64,
    /// Region of the buffer holding valid content. An empty rectangle means
    /// the whole buffer.
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
}

impl QueueBufferInput {
    pub fn new(timestamp: i64) -> Self {
        QueueBufferInput {
            timestamp,
            ..Default::default()
        }
    }

    pub fn crop(self, crop: Rect) -> Self {
        QueueBufferInput { crop, ..self }
    }

    pub fn scaling_mode(self, scaling_mode: ScalingMode) -> Self {
        QueueBufferInput {
            scaling_mode,
            ..self
        }
    }

    pub fn transform(self, transform: Transform) -> Self {
        QueueBufferInput { transform, ..self }
    }
}

/// Properties of the queue that the producer can query.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum QueryKind {
    Width = 0,
    Height = 1,
    Format = 2,
    MinUndequeuedBuffers = 3,
    /// 1 if the consumer has more than one frame waiting, 0 otherwise.
    ConsumerRunningBehind = 9,
    ConsumerUsage = 10,
}

/// Producer side of a buffer queue.
///
/// All methods except `connect`, `set_synchronous_mode` and `query` require
/// the producer to be connected, and fail with `NotInitialized` otherwise.
pub trait Producer {
    type Buffer: GraphicBuffer;

    /// Bind the queue to producer `api`. Connecting again with the same API
    /// is a no-op.
    fn connect(&self, api: NativeWindowApi) -> QueueResult<QueueBufferOutput>;

    /// Unbind producer `api` from the queue. All the buffers are freed and
    /// pending frames are dropped.
    fn disconnect(&self, api: NativeWindowApi) -> QueueResult<()>;

    /// Change the number of slots used by the queue. This frees all the
    /// buffers and drops pending frames, so it can only be done while no slot
    /// is dequeued. A count of 0 lets the consumer decide.
    fn set_buffer_count(&self, buffer_count: usize) -> QueueResult<()>;

    /// Obtain a free slot holding a buffer of the requested geometry.
    ///
    /// `width` and `height` must be both zero, in which case the default
    /// size of the queue is used, or both non-zero. A `format` of
    /// `PixelFormat::NONE` selects the default format.
    ///
    /// In synchronous mode, this blocks until a slot becomes available. In
    /// asynchronous mode, the oldest pending frame is dropped to make room,
    /// and `Busy` is returned if that is not possible.
    fn dequeue(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> QueueResult<DequeueOutput>;

    /// Returns the buffer of dequeued slot `slot`.
    fn request_buffer(&self, slot: usize) -> QueueResult<Arc<Self::Buffer>>;

    /// Publish the content of dequeued slot `slot` to the consumer.
    fn queue(&self, slot: usize, input: QueueBufferInput) -> QueueResult<QueueBufferOutput>;

    /// Return dequeued slot `slot` to the queue without publishing it.
    fn cancel(&self, slot: usize) -> QueueResult<()>;

    fn set_synchronous_mode(&self, enabled: bool) -> QueueResult<()>;

    fn query(&self, what: QueryKind) -> QueueResult<u32>;
}

impl<A: BufferAllocator> Producer for BufferQueue<A> {
    type Buffer = A::Buffer;

    fn connect(&self, api: NativeWindowApi) -> QueueResult<QueueBufferOutput> {
        let mut core = self.lock_core();
        core.check_abandoned()?;

        match core.connected_api {
            Some(connected) if connected == api => (),
            Some(connected) => return Err(QueueError::AlreadyConnected(connected)),
            None => {
                core.connected_api = Some(api);
                core.connection_id += 1;
                debug!("[{}] Connected to {}", self.name, api);
            }
        }

        Ok(core.output())
    }

    fn disconnect(&self, api: NativeWindowApi) -> QueueResult<()> {
        {
            let mut core = self.lock_core();
            core.check_abandoned()?;
            if core.connected_api != Some(api) {
                return Err(QueueError::BadValue("queue is not connected to this API"));
            }

            let buffers = core.reset_slots();
            core.connected_api = None;
            core.last_timestamp = None;
            self.free_buffers(buffers);
            self.dequeue_condition.notify_all();
            debug!("[{}] Disconnected from {}", self.name, api);
        }

        if let Some(listener) = self.listener() {
            listener.on_producer_disconnected();
            listener.on_buffers_released();
        }

        Ok(())
    }

    fn set_buffer_count(&self, buffer_count: usize) -> QueueResult<()> {
        {
            let mut core = self.lock_core();
            core.check_connected()?;

            if buffer_count > NUM_BUFFER_SLOTS {
                return Err(QueueError::BadValue("buffer count too large"));
            }
            if core.slots.count(core.buffer_count, SlotState::Dequeued) > 0 {
                return Err(QueueError::InvalidOperation(
                    "cannot change the buffer count while buffers are dequeued",
                ));
            }

            if buffer_count == 0 {
                // The server count takes effect on the next dequeue.
                core.client_buffer_count = 0;
                return Ok(());
            }

            if buffer_count < self.min_buffer_count() {
                return Err(QueueError::BadValue("buffer count too small"));
            }

            let buffers = core.reset_slots();
            core.buffer_count = buffer_count;
            core.client_buffer_count = buffer_count;
            self.free_buffers(buffers);
            self.dequeue_condition.notify_all();
            debug!("[{}] Buffer count set to {}", self.name, buffer_count);
        }

        if let Some(listener) = self.listener() {
            listener.on_buffers_released();
        }

        Ok(())
    }

    fn dequeue(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> QueueResult<DequeueOutput> {
        if (width == 0) != (height == 0) {
            return Err(QueueError::BadValue(
                "width and height must be both zero or both non-zero",
            ));
        }

        let mut flags = DequeueFlags::empty();
        let mut core = self.lock_core();
        let connection_id = core.check_connected()?;

        let (free, request) = loop {
            core.check_connection(connection_id)?;

            // Apply a buffer count change requested by the consumer, once
            // nothing is in flight anymore.
            if core.client_buffer_count == 0
                && core.server_buffer_count != core.buffer_count
                && core.slots.count(core.buffer_count, SlotState::Dequeued) == 0
            {
                // In synchronous mode, pending frames are delivered first.
                // Asynchronous mode drops them.
                if core.synchronous_mode && !core.fifo.is_empty() {
                    core = self.wait_for_slot(core);
                    continue;
                }
                if !core.fifo.is_empty() {
                    debug!(
                        "[{}] Dropping {} pending frames for buffer count change",
                        self.name,
                        core.fifo.len()
                    );
                }

                let buffers = core.reset_slots();
                core.buffer_count = core.server_buffer_count;
                self.free_buffers(buffers);
                flags |= DequeueFlags::RELEASE_ALL_BUFFERS;
                debug!(
                    "[{}] Buffer count changed to {} by consumer",
                    self.name, core.buffer_count
                );
            }

            let (width, height) = match width {
                0 => (core.default_width, core.default_height),
                _ => (width, height),
            };
            let format = if format.is_none() {
                core.default_format
            } else {
                format
            };
            let request = BufferDescriptor::new(width, height, format, usage | core.consumer_usage);

            let max_dequeued = core
                .buffer_count
                .saturating_sub(self.min_undequeued_buffers)
                .max(1);
            let dequeued = core.slots.count(core.buffer_count, SlotState::Dequeued);

            if dequeued < max_dequeued {
                if let Some(free) = core.slots.find_free(core.buffer_count, &request) {
                    break (free, request);
                }
            }

            if core.synchronous_mode {
                core = self.wait_for_slot(core);
                continue;
            }

            if dequeued >= max_dequeued {
                return Err(QueueError::Busy);
            }

            // Asynchronous mode: make room by dropping the oldest frame.
            let dropped = core.fifo.pop_front().ok_or(QueueError::Busy)?;
            if let Some(slot) = core.slots.get_mut(dropped) {
                slot.state = SlotState::Free;
                debug!(
                    "[{}] Dropping frame {} in slot {}",
                    self.name, slot.frame_number, dropped
                );
            }
        };

        let FreeSlot { index, reusable } = free;
        let slot = core
            .slots
            .get_mut(index)
            .ok_or(QueueError::BadIndex(index))?;
        slot.state = SlotState::Dequeued;

        if !reusable {
            if let Some(old) = slot.buffer.take() {
                self.allocator.free(old);
            }

            match self.allocator.allocate(&request) {
                Ok(buffer) => slot.buffer = Some(Arc::new(buffer)),
                Err(e) => {
                    slot.state = SlotState::Free;
                    error!(
                        "[{}] Failed to allocate {}x{} {} buffer for slot {}: {}",
                        self.name, request.width, request.height, request.format, index, e
                    );
                    return Err(e.into());
                }
            }

            slot.request_buffer_called = false;
            slot.fence = None;
            flags |= DequeueFlags::BUFFER_NEEDS_REALLOCATION;
            debug!(
                "[{}] Allocated {}x{} {} buffer for slot {}",
                self.name, request.width, request.height, request.format, index
            );
        }

        let fence = match self.sync_mode {
            SyncMode::FenceGated => slot.fence.take(),
            SyncMode::ImmediateFree => None,
        };
        drop(core);

        if flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS) {
            if let Some(listener) = self.listener() {
                listener.on_buffers_released();
            }
        }

        Ok(DequeueOutput {
            slot: index,
            fence,
            flags,
        })
    }

    fn request_buffer(&self, slot: usize) -> QueueResult<Arc<A::Buffer>> {
        let mut core = self.lock_core();
        core.check_connected()?;

        let slot = core.dequeued_slot_mut(slot)?;
        let buffer = slot
            .buffer
            .clone()
            .ok_or(QueueError::BadValue("slot has no buffer"))?;
        slot.request_buffer_called = true;

        Ok(buffer)
    }

    fn queue(&self, index: usize, input: QueueBufferInput) -> QueueResult<QueueBufferOutput> {
        let output = {
            let mut guard = self.lock_core();
            guard.check_connected()?;
            let core = &mut *guard;
            let frame_number = core.frame_counter + 1;

            let slot = core.dequeued_slot_mut(index)?;
            let bounds = match &slot.buffer {
                Some(buffer) => {
                    let desc = buffer.descriptor();
                    Rect::from_size(desc.width, desc.height)
                }
                None => return Err(QueueError::BadValue("slot has no buffer")),
            };
            let crop = if input.crop.is_empty() {
                bounds
            } else if bounds.contains(&input.crop) {
                input.crop
            } else {
                return Err(QueueError::BadValue("crop rectangle exceeds buffer bounds"));
            };

            if !slot.request_buffer_called {
                error!(
                    "[{}] Slot {} queued without its buffer being requested",
                    self.name, index
                );
            }

            slot.crop = crop;
            slot.transform = input.transform;
            slot.scaling_mode = input.scaling_mode;
            slot.timestamp = input.timestamp;
            slot.frame_number = frame_number;
            slot.state = SlotState::Queued;

            if let Some(last) = core.last_timestamp {
                if input.timestamp < last {
                    warn!(
                        "[{}] Timestamp of frame {} went backwards ({} < {})",
                        self.name, frame_number, input.timestamp, last
                    );
                }
            }
            core.last_timestamp = Some(input.timestamp);
            core.frame_counter = frame_number;
            core.fifo.push_back(index);
            self.dequeue_condition.notify_all();

            core.output()
        };

        if let Some(listener) = self.listener() {
            listener.on_frame_available();
        }

        Ok(output)
    }

    fn cancel(&self, index: usize) -> QueueResult<()> {
        let mut core = self.lock_core();
        core.check_connected()?;

        core.dequeued_slot_mut(index)?.state = SlotState::Free;
        self.dequeue_condition.notify_all();

        Ok(())
    }

    fn set_synchronous_mode(&self, enabled: bool) -> QueueResult<()> {
        let mut core = self.lock_core();
        core.check_abandoned()?;

        if enabled && !self.allow_synchronous_mode {
            debug!("[{}] Synchronous mode is not allowed, ignoring", self.name);
            return Ok(());
        }

        if core.synchronous_mode != enabled {
            core.synchronous_mode = enabled;
            self.dequeue_condition.notify_all();
            debug!(
                "[{}] Switched to {} mode",
                self.name,
                if enabled { "synchronous" } else { "asynchronous" }
            );
        }

        Ok(())
    }

    fn query(&self, what: QueryKind) -> QueueResult<u32> {
        let core = self.lock_core();
        core.check_abandoned()?;

        Ok(match what {
            QueryKind::Width => core.default_width,
            QueryKind::Height => core.default_height,
            QueryKind::Format => core.default_format.to_u32(),
            QueryKind::MinUndequeuedBuffers => self.min_undequeued_buffers as u32,
            QueryKind::ConsumerRunningBehind => (core.fifo.len() > 1) as u32,
            QueryKind::ConsumerUsage => core.consumer_usage.bits(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::tests::pending_fence;
    use crate::memory::{AllocError, HeapAllocator};
    use crate::queue::consumer::Consumer;
    use crate::queue::{NotInitializedReason, QueueConfig};

    use std::io::Write;

    fn new_queue(config: QueueConfig) -> BufferQueue<Arc<HeapAllocator>> {
        let queue = BufferQueue::new(Arc::new(HeapAllocator::new()), config).unwrap();
        queue.connect(NativeWindowApi::Egl).unwrap();
        queue
    }

    fn dequeue(queue: &BufferQueue<Arc<HeapAllocator>>, width: u32, height: u32) -> DequeueOutput {
        queue
            .dequeue(width, height, PixelFormat::RGBA_8888, BufferUsage::empty())
            .unwrap()
    }

    /// Number of queued slots that are waiting in the FIFO, i.e. not the
    /// consumer's current one.
    fn pending_queued(queue: &BufferQueue<Arc<HeapAllocator>>) -> usize {
        let core = queue.lock_core();
        core.slots
            .iter(core.buffer_count)
            .filter(|(i, s)| s.state == SlotState::Queued && core.current != Some(*i))
            .count()
    }

    #[test]
    fn test_connect() {
        let queue = BufferQueue::new(
            HeapAllocator::new(),
            QueueConfig::new().default_size(320, 240),
        )
        .unwrap();

        assert!(matches!(
            queue.dequeue(0, 0, PixelFormat::NONE, BufferUsage::empty()),
            Err(QueueError::NotInitialized(NotInitializedReason::Disconnected))
        ));

        let output = queue.connect(NativeWindowApi::Egl).unwrap();
        assert_eq!((output.width, output.height), (320, 240));
        assert_eq!(output.num_pending_buffers, 0);

        // Reconnecting with the same API is fine, not with another one.
        queue.connect(NativeWindowApi::Egl).unwrap();
        assert!(matches!(
            queue.connect(NativeWindowApi::Cpu),
            Err(QueueError::AlreadyConnected(NativeWindowApi::Egl))
        ));

        assert!(matches!(
            queue.disconnect(NativeWindowApi::Cpu),
            Err(QueueError::BadValue(_))
        ));
        queue.disconnect(NativeWindowApi::Egl).unwrap();
        assert!(matches!(
            queue.disconnect(NativeWindowApi::Egl),
            Err(QueueError::BadValue(_))
        ));
        queue.connect(NativeWindowApi::Cpu).unwrap();
    }

    #[test]
    fn test_disconnect_frees_everything() {
        let queue = new_queue(QueueConfig::new());
        let first = dequeue(&queue, 16, 16).slot;
        queue.queue(first, QueueBufferInput::new(1)).unwrap();
        let item = queue.acquire_next().unwrap().unwrap();
        let second = dequeue(&queue, 16, 16).slot;
        queue.queue(second, QueueBufferInput::new(2)).unwrap();

        queue.disconnect(NativeWindowApi::Egl).unwrap();
        assert_eq!(queue.num_pending_buffers(), 0);
        assert!(queue.current_frame().is_none());
        for i in 0..queue.buffer_count() {
            assert_eq!(queue.slot_state(i), Some(SlotState::Free));
            assert!(!queue.slot_has_buffer(i));
        }
        // The consumer still holds a reference to its last frame.
        assert_eq!(queue.allocator().live_buffers(), 1);
        drop(item);
        assert_eq!(queue.allocator().live_buffers(), 0);

        assert!(matches!(
            queue.request_buffer(second),
            Err(QueueError::NotInitialized(NotInitializedReason::Disconnected))
        ));
    }

    #[test]
    fn test_dequeue_bad_size() {
        let queue = new_queue(QueueConfig::new());
        assert!(matches!(
            queue.dequeue(0, 16, PixelFormat::RGBA_8888, BufferUsage::empty()),
            Err(QueueError::BadValue(_))
        ));
        assert!(matches!(
            queue.dequeue(16, 0, PixelFormat::RGBA_8888, BufferUsage::empty()),
            Err(QueueError::BadValue(_))
        ));
    }

    #[test]
    fn test_dequeue_defaults() {
        let queue = new_queue(
            QueueConfig::new()
                .default_size(48, 32)
                .default_format(PixelFormat::RGB_565)
                .consumer_usage(BufferUsage::HW_COMPOSER),
        );

        let slot = queue
            .dequeue(0, 0, PixelFormat::NONE, BufferUsage::SW_WRITE_OFTEN)
            .unwrap()
            .slot;
        let buffer = queue.request_buffer(slot).unwrap();
        let desc = buffer.descriptor();
        assert_eq!((desc.width, desc.height), (48, 32));
        assert_eq!(desc.format, PixelFormat::RGB_565);
        assert_eq!(
            desc.usage,
            BufferUsage::SW_WRITE_OFTEN | BufferUsage::HW_COMPOSER
        );
    }

    #[test]
    fn test_bufferqueue_scenario() {
        let queue = new_queue(QueueConfig::new().buffer_count(3));

        let s0 = dequeue(&queue, 64, 64).slot;
        let s1 = dequeue(&queue, 64, 64).slot;
        assert_eq!((s0, s1), (0, 1));

        queue.queue(s0, QueueBufferInput::new(100)).unwrap();
        let item = queue.acquire_next().unwrap().unwrap();
        assert_eq!((item.slot, item.timestamp), (0, 100));

        queue.queue(s1, QueueBufferInput::new(200)).unwrap();
        let item = queue.acquire_next().unwrap().unwrap();
        assert_eq!((item.slot, item.timestamp), (1, 200));
        assert_eq!(queue.slot_state(0), Some(SlotState::Free));
        assert_eq!(queue.slot_state(1), Some(SlotState::Queued));
    }

    #[test]
    fn test_set_buffer_count() {
        let queue = new_queue(QueueConfig::new());
        let slot = dequeue(&queue, 64, 64).slot;
        assert_eq!(slot, 0);

        assert!(matches!(
            queue.set_buffer_count(2),
            Err(QueueError::InvalidOperation(_))
        ));

        queue.cancel(slot).unwrap();
        queue.set_buffer_count(2).unwrap();
        assert_eq!(queue.buffer_count(), 2);
        for i in 0..NUM_BUFFER_SLOTS {
            assert!(matches!(queue.slot_state(i), None | Some(SlotState::Free)));
            assert!(!queue.slot_has_buffer(i));
        }
        assert_eq!(queue.allocator().live_buffers(), 0);

        assert!(matches!(queue.set_buffer_count(1), Err(QueueError::BadValue(_))));
        assert!(matches!(queue.set_buffer_count(33), Err(QueueError::BadValue(_))));

        // The next dequeue allocates again.
        let out = dequeue(&queue, 64, 64);
        assert!(out.flags.contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
    }

    #[test]
    fn test_set_buffer_count_drops_pending_frames() {
        let queue = new_queue(QueueConfig::new());
        let slot = dequeue(&queue, 64, 64).slot;
        queue.queue(slot, QueueBufferInput::new(0)).unwrap();

        queue.set_buffer_count(5).unwrap();
        assert_eq!(queue.num_pending_buffers(), 0);
        assert!(queue.acquire_next().unwrap().is_none());
    }

    #[test]
    fn test_request_buffer_errors() {
        let queue = new_queue(QueueConfig::new());
        assert!(matches!(queue.request_buffer(3), Err(QueueError::BadIndex(3))));
        assert!(matches!(
            queue.request_buffer(40),
            Err(QueueError::BadIndex(40))
        ));
        assert!(matches!(queue.request_buffer(0), Err(QueueError::BadValue(_))));

        let slot = dequeue(&queue, 8, 8).slot;
        let buffer = queue.request_buffer(slot).unwrap();
        assert_eq!(buffer.descriptor().width, 8);
    }

    #[test]
    fn test_queue_errors() {
        let queue = new_queue(QueueConfig::new());
        assert!(matches!(
            queue.queue(0, QueueBufferInput::new(0)),
            Err(QueueError::BadValue(_))
        ));
        assert!(matches!(
            queue.queue(7, QueueBufferInput::new(0)),
            Err(QueueError::BadIndex(7))
        ));
        assert!(matches!(queue.cancel(1), Err(QueueError::BadValue(_))));

        let slot = dequeue(&queue, 64, 32).slot;
        assert!(matches!(
            queue.queue(
                slot,
                QueueBufferInput::new(0).crop(Rect::new(32, 0, 64, 32))
            ),
            Err(QueueError::BadValue(_))
        ));
        // A failed queue leaves the slot dequeued.
        assert_eq!(queue.slot_state(slot), Some(SlotState::Dequeued));

        queue.queue(slot, QueueBufferInput::new(0)).unwrap();
        assert!(matches!(
            queue.queue(slot, QueueBufferInput::new(1)),
            Err(QueueError::BadValue(_))
        ));
        assert!(matches!(queue.cancel(slot), Err(QueueError::BadValue(_))));
    }

    #[test]
    fn test_metadata_round_trip() {
        let queue = new_queue(QueueConfig::new());
        let slot = dequeue(&queue, 64, 64).slot;
        queue.request_buffer(slot).unwrap();

        let input = QueueBufferInput::new(123_456)
            .crop(Rect::new(8, 4, 32, 16))
            .transform(Transform::ROT_90 | Transform::FLIP_H)
            .scaling_mode(ScalingMode::ScaleCrop);
        queue.queue(slot, input).unwrap();

        let item = queue.acquire_next().unwrap().unwrap();
        assert_eq!(item.slot, slot);
        assert_eq!(item.crop, input.crop);
        assert_eq!(item.transform, input.transform);
        assert_eq!(item.scaling_mode, ScalingMode::ScaleCrop);
        assert_eq!(item.timestamp, 123_456);
        assert_eq!(item.frame_number, 1);
    }

    #[test]
    fn test_empty_crop_is_whole_buffer() {
        let queue = new_queue(QueueConfig::new());
        let slot = dequeue(&queue, 40, 30).slot;
        queue.queue(slot, QueueBufferInput::new(0)).unwrap();

        let item = queue.acquire_next().unwrap().unwrap();
        assert_eq!(item.crop, Rect::from_size(40, 30));
    }

    #[test]
    fn test_queue_ordering() {
        let queue = new_queue(QueueConfig::new().buffer_count(6));
        let slots: Vec<_> = (0..5).map(|_| dequeue(&queue, 16, 16).slot).collect();

        // Queue in an order different from the slot order.
        let order = [3, 0, 4, 1, 2];
        for (timestamp, &i) in order.iter().enumerate() {
            let output = queue
                .queue(slots[i], QueueBufferInput::new(timestamp as i64 * 10))
                .unwrap();
            assert_eq!(output.num_pending_buffers, timestamp + 1);
        }
        assert_eq!(queue.query(QueryKind::ConsumerRunningBehind).unwrap(), 1);

        let mut last_frame_number = 0;
        for (timestamp, &i) in order.iter().enumerate() {
            let item = queue.acquire_next().unwrap().unwrap();
            assert_eq!(item.slot, slots[i]);
            assert_eq!(item.timestamp, timestamp as i64 * 10);
            assert!(item.frame_number > last_frame_number);
            last_frame_number = item.frame_number;
            assert_eq!(pending_queued(&queue), queue.num_pending_buffers());
        }
        assert!(queue.acquire_next().unwrap().is_none());
    }

    #[test]
    fn test_cancel_reuses_buffer() {
        let queue = new_queue(QueueConfig::new());
        let first = dequeue(&queue, 64, 64);
        assert!(first
            .flags
            .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
        let id = queue.request_buffer(first.slot).unwrap().id();
        queue.cancel(first.slot).unwrap();
        assert_eq!(queue.slot_state(first.slot), Some(SlotState::Free));

        let second = dequeue(&queue, 64, 64);
        assert_eq!(second.slot, first.slot);
        assert!(second.flags.is_empty());
        assert_eq!(queue.request_buffer(second.slot).unwrap().id(), id);
        assert_eq!(queue.allocator().num_allocations(), 1);
    }

    #[test]
    fn test_reallocation_on_mismatch() {
        let queue = new_queue(QueueConfig::new().buffer_count(2));
        let first = dequeue(&queue, 64, 64).slot;
        let old = queue.request_buffer(first).unwrap();
        queue.cancel(first).unwrap();

        // Slot 1 has no buffer yet and is preferred over reallocating slot 0.
        let second = dequeue(&queue, 32, 32);
        assert_eq!(second.slot, 1);
        queue.cancel(second.slot).unwrap();

        let third = dequeue(&queue, 16, 16);
        assert_eq!(third.slot, 0);
        assert!(third.flags.contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
        let new = queue.request_buffer(third.slot).unwrap();
        assert_ne!(new.id(), old.id());
        assert_eq!(new.descriptor().width, 16);
    }

    #[test]
    fn test_async_dequeue_drops_oldest_frame() {
        let queue = new_queue(QueueConfig::new().buffer_count(3));
        for timestamp in [10, 20, 30] {
            let slot = dequeue(&queue, 16, 16).slot;
            queue.queue(slot, QueueBufferInput::new(timestamp)).unwrap();
        }
        assert_eq!(queue.num_pending_buffers(), 3);

        // No free slot left: frame 10 in slot 0 gets dropped.
        let out = dequeue(&queue, 16, 16);
        assert_eq!(out.slot, 0);
        assert!(out.flags.is_empty());
        assert_eq!(queue.num_pending_buffers(), 2);
        assert_eq!(pending_queued(&queue), 2);

        let item = queue.acquire_next().unwrap().unwrap();
        assert_eq!(item.timestamp, 20);
    }

    #[test]
    fn test_async_dequeue_busy() {
        let queue = new_queue(QueueConfig::new().buffer_count(3));
        dequeue(&queue, 16, 16);
        dequeue(&queue, 16, 16);
        assert!(matches!(
            queue.dequeue(16, 16, PixelFormat::RGBA_8888, BufferUsage::empty()),
            Err(QueueError::Busy)
        ));

        // Two slots: the current one is never evicted.
        let queue = new_queue(QueueConfig::new().buffer_count(2));
        let slot = dequeue(&queue, 16, 16).slot;
        queue.queue(slot, QueueBufferInput::new(0)).unwrap();
        queue.acquire_next().unwrap().unwrap();
        let slot = dequeue(&queue, 16, 16).slot;
        queue.queue(slot, QueueBufferInput::new(1)).unwrap();
        let slot = dequeue(&queue, 16, 16).slot;
        assert_eq!(slot, 1);
        assert!(matches!(
            queue.dequeue(16, 16, PixelFormat::RGBA_8888, BufferUsage::empty()),
            Err(QueueError::Busy)
        ));
    }

    #[test]
    fn test_out_of_memory() {
        // Room for exactly one 16x16 RGBA buffer.
        let allocator = HeapAllocator::with_budget(16 * 16 * 4);
        let queue = BufferQueue::new(allocator, QueueConfig::new()).unwrap();
        queue.connect(NativeWindowApi::Cpu).unwrap();

        let slot = queue
            .dequeue(16, 16, PixelFormat::RGBA_8888, BufferUsage::empty())
            .unwrap()
            .slot;
        let err = queue
            .dequeue(16, 16, PixelFormat::RGBA_8888, BufferUsage::empty())
            .unwrap_err();
        assert!(matches!(err, QueueError::OutOfMemory(AllocError::NoMem(_))));
        assert_eq!(queue.slot_state(1), Some(SlotState::Free));

        queue.cancel(slot).unwrap();
        queue
            .dequeue(16, 16, PixelFormat::RGBA_8888, BufferUsage::empty())
            .unwrap();
    }

    #[test]
    fn test_synchronous_mode_not_allowed() {
        let queue = new_queue(QueueConfig::new().disallow_synchronous_mode());
        queue.set_synchronous_mode(true).unwrap();
        assert!(!queue.is_synchronous());

        let queue = new_queue(QueueConfig::new());
        queue.set_synchronous_mode(true).unwrap();
        assert!(queue.is_synchronous());
    }

    #[test]
    fn test_query() {
        let queue = new_queue(
            QueueConfig::new()
                .default_size(640, 480)
                .default_format(PixelFormat::RGBX_8888)
                .min_undequeued_buffers(2),
        );

        assert_eq!(queue.query(QueryKind::Width).unwrap(), 640);
        assert_eq!(queue.query(QueryKind::Height).unwrap(), 480);
        assert_eq!(queue.query(QueryKind::Format).unwrap(), 2);
        assert_eq!(queue.query(QueryKind::MinUndequeuedBuffers).unwrap(), 2);
        assert_eq!(queue.query(QueryKind::ConsumerRunningBehind).unwrap(), 0);
        assert_eq!(
            queue.query(QueryKind::ConsumerUsage).unwrap(),
            BufferUsage::HW_TEXTURE.bits()
        );
        assert_eq!(QueryKind::n(10), Some(QueryKind::ConsumerUsage));
    }

    #[test]
    fn test_fence_handoff() {
        let queue = new_queue(QueueConfig::new().buffer_count(2).fence_gated());

        let slot = dequeue(&queue, 16, 16).slot;
        queue.queue(slot, QueueBufferInput::new(0)).unwrap();
        queue.acquire_next().unwrap().unwrap();
        let (fence, mut signal) = pending_fence();
        queue.set_release_fence(fence).unwrap();

        // Queue another frame so the consumer releases slot 0.
        let other = dequeue(&queue, 16, 16);
        assert!(other.fence.is_none());
        queue.queue(other.slot, QueueBufferInput::new(1)).unwrap();
        queue.acquire_next().unwrap().unwrap();

        let out = dequeue(&queue, 16, 16);
        assert_eq!(out.slot, slot);
        let fence = out.fence.unwrap();
        assert!(!fence.is_signaled().unwrap());
        signal.write_all(&[1]).unwrap();
        fence.wait(None).unwrap();
    }

    #[test]
    fn test_deferred_server_buffer_count() {
        let queue = new_queue(QueueConfig::new().buffer_count(4));
        let slot = dequeue(&queue, 16, 16).slot;
        queue.queue(slot, QueueBufferInput::new(0)).unwrap();

        // Shrinking is deferred until the next dequeue.
        queue.set_buffer_count_server(2).unwrap();
        assert_eq!(queue.buffer_count(), 4);

        queue.acquire_next().unwrap().unwrap();
        let out = dequeue(&queue, 16, 16);
        assert!(out.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS));
        assert!(out.flags.contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
        assert_eq!(queue.buffer_count(), 2);
        assert!(queue.current_frame().is_none());

        // A client count takes precedence over the server one.
        queue.cancel(out.slot).unwrap();
        queue.set_buffer_count(3).unwrap();
        queue.set_buffer_count_server(5).unwrap();
        let out = dequeue(&queue, 16, 16);
        assert!(!out.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS));
        assert_eq!(queue.buffer_count(), 3);

        // Until the producer gives up on its own count.
        queue.cancel(out.slot).unwrap();
        queue.set_buffer_count(0).unwrap();
        let out = dequeue(&queue, 16, 16);
        assert!(out.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS));
        assert_eq!(queue.buffer_count(), 5);
    }
}
