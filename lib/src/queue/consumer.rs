//! Operations performed by the consumer, i.e. the compositor or encoder that
//! reads the frames queued by the producer.
use super::{BufferQueue, QueueCore, QueueError, QueueResult, SlotState, NUM_BUFFER_SLOTS};
use crate::fence::{Fence, SyncMode};
use crate::memory::{BufferAllocator, BufferUsage, GraphicBuffer};
use crate::{PixelFormat, Rect, ScalingMode, Transform};

use std::sync::Arc;

use log::debug;

/// Receives the notifications of a queue.
///
/// Listeners are never invoked with the queue locked, and are thus free to
/// call back into the queue. They may be invoked concurrently from the
/// producer and consumer threads.
pub trait ConsumerListener: Send + Sync {
    /// A new frame has been queued and can be acquired.
    fn on_frame_available(&self);

    /// The buffers of the queue have been freed, so any reference to them
    /// kept by the consumer can be dropped.
    fn on_buffers_released(&self) {}

    fn on_producer_disconnected(&self) {}
}

/// Closures can be used as listeners that only care about new frames.
impl<F> ConsumerListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_frame_available(&self) {
        self()
    }
}

/// A frame acquired by the consumer.
#[derive(Debug)]
pub struct BufferItem<B: GraphicBuffer> {
    pub slot: usize,
    pub buffer: Arc<B>,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub timestamp: i64,
    pub frame_number: u64,
}

impl<B: GraphicBuffer> Clone for BufferItem<B> {
    fn clone(&self) -> Self {
        BufferItem {
            buffer: Arc::clone(&self.buffer),
            ..*self
        }
    }
}

/// Consumer side of a buffer queue.
pub trait Consumer {
    type Buffer: GraphicBuffer;

    /// Take the oldest frame queued by the producer and make it the current
    /// one. The previous current frame is released to the producer.
    ///
    /// Returns `None` if no frame is pending. This never blocks: consumers
    /// are expected to wait for `ConsumerListener::on_frame_available`.
    fn acquire_next(&self) -> QueueResult<Option<BufferItem<Self::Buffer>>>;

    /// The frame returned by the last `acquire_next`, if it is still valid.
    fn current_frame(&self) -> Option<BufferItem<Self::Buffer>>;

    /// Attach `fence` to the current frame. The producer receives it along
    /// with the slot on its next dequeue. Only valid for fence-gated queues.
    fn set_release_fence(&self, fence: Fence) -> QueueResult<()>;

    /// Request a number of slots. This only takes effect while the producer
    /// has not set a buffer count of its own.
    fn set_buffer_count_server(&self, buffer_count: usize) -> QueueResult<()>;

    fn set_default_buffer_size(&self, width: u32, height: u32) -> QueueResult<()>;

    fn set_default_buffer_format(&self, format: PixelFormat);

    fn set_consumer_usage_bits(&self, usage: BufferUsage);

    fn set_transform_hint(&self, hint: Transform);

    fn set_listener(&self, listener: Option<Arc<dyn ConsumerListener>>);

    /// Permanently shut the queue down. All buffers are freed and any
    /// blocked or further producer call fails with `NotInitialized`.
    fn abandon(&self);

    fn is_abandoned(&self) -> bool;
}

impl<B: GraphicBuffer> QueueCore<B> {
    fn item(&self, index: usize) -> Option<BufferItem<B>> {
        let slot = self.slots.get(index)?;

        Some(BufferItem {
            slot: index,
            buffer: Arc::clone(slot.buffer.as_ref()?),
            crop: slot.crop,
            transform: slot.transform,
            scaling_mode: slot.scaling_mode,
            timestamp: slot.timestamp,
            frame_number: slot.frame_number,
        })
    }
}

impl<A: BufferAllocator> Consumer for BufferQueue<A> {
    type Buffer = A::Buffer;

    fn acquire_next(&self) -> QueueResult<Option<BufferItem<A::Buffer>>> {
        let mut guard = self.lock_core();
        guard.check_abandoned()?;
        let core = &mut *guard;

        let index = match core.fifo.pop_front() {
            Some(index) => index,
            None => return Ok(None),
        };

        if let Some(previous) = core.current.replace(index) {
            match core.slots.get_mut(previous) {
                Some(slot) if slot.state == SlotState::Queued => slot.state = SlotState::Free,
                _ => (),
            }
        }
        // Producers may be waiting for a free slot or for the FIFO to drain.
        self.dequeue_condition.notify_all();

        core.item(index)
            .map(Some)
            .ok_or(QueueError::InvalidOperation("acquired slot has no buffer"))
    }

    fn current_frame(&self) -> Option<BufferItem<A::Buffer>> {
        let core = self.lock_core();
        core.current.and_then(|index| core.item(index))
    }

    fn set_release_fence(&self, fence: Fence) -> QueueResult<()> {
        if self.sync_mode != SyncMode::FenceGated {
            return Err(QueueError::InvalidOperation(
                "release fences require a fence-gated queue",
            ));
        }

        let mut guard = self.lock_core();
        guard.check_abandoned()?;
        let core = &mut *guard;

        let slot = core
            .current
            .and_then(|index| core.slots.get_mut(index))
            .ok_or(QueueError::BadValue("no current buffer"))?;
        slot.fence = Some(fence);

        Ok(())
    }

    fn set_buffer_count_server(&self, buffer_count: usize) -> QueueResult<()> {
        if buffer_count > NUM_BUFFER_SLOTS || buffer_count < self.min_buffer_count() {
            return Err(QueueError::BadValue("buffer count out of range"));
        }

        let mut core = self.lock_core();
        core.check_abandoned()?;

        core.server_buffer_count = buffer_count;
        if buffer_count == core.buffer_count {
            return Ok(());
        }

        if core.client_buffer_count == 0 && buffer_count > core.buffer_count {
            // Growing does not affect the slots in use.
            core.buffer_count = buffer_count;
            self.dequeue_condition.notify_all();
            debug!("[{}] Buffer count raised to {}", self.name, buffer_count);
        } else {
            debug!(
                "[{}] Buffer count change to {} deferred",
                self.name, buffer_count
            );
        }

        Ok(())
    }

    fn set_default_buffer_size(&self, width: u32, height: u32) -> QueueResult<()> {
        if width == 0 || height == 0 {
            return Err(QueueError::BadValue("default size cannot be zero"));
        }

        let mut core = self.lock_core();
        core.default_width = width;
        core.default_height = height;

        Ok(())
    }

    fn set_default_buffer_format(&self, format: PixelFormat) {
        self.lock_core().default_format = format;
    }

    fn set_consumer_usage_bits(&self, usage: BufferUsage) {
        self.lock_core().consumer_usage = usage;
    }

    fn set_transform_hint(&self, hint: Transform) {
        self.lock_core().transform_hint = hint;
    }

    fn set_listener(&self, listener: Option<Arc<dyn ConsumerListener>>) {
        *self.listener.lock().unwrap() = listener;
    }

    fn abandon(&self) {
        let listener = {
            let mut core = self.lock_core();
            if core.abandoned {
                return;
            }

            core.abandoned = true;
            let buffers = core.reset_slots();
            self.free_buffers(buffers);
            self.dequeue_condition.notify_all();
            debug!("[{}] Queue abandoned", self.name);

            self.listener.lock().unwrap().take()
        };

        if let Some(listener) = listener {
            listener.on_buffers_released();
        }
    }

    fn is_abandoned(&self) -> bool {
        self.lock_core().abandoned
    }
}
