pub mod consumer;
pub mod producer;
mod slot;

pub use slot::SlotState;

use crate::fence::SyncMode;
use crate::memory::{AllocError, BufferAllocator, BufferUsage, GraphicBuffer};
use crate::{NativeWindowApi, PixelFormat, Transform};
use consumer::ConsumerListener;
use slot::SlotTable;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::debug;
use nix::errno::Errno;
use thiserror::Error;

/// Maximum number of slots a queue can use.
pub const NUM_BUFFER_SLOTS: usize = 32;

/// Construction parameters of a `BufferQueue`.
///
/// ```
/// # use bufferqueue::{QueueConfig, PixelFormat};
/// let config = QueueConfig::new()
///     .name("preview")
///     .buffer_count(4)
///     .default_size(1280, 720)
///     .default_format(PixelFormat::RGBX_8888)
///     .synchronous();
/// ```
#[derive(Debug, Clone)]
pub struct QueueConfig {
    name: String,
    buffer_count: usize,
    min_undequeued_buffers: usize,
    default_width: u32,
    default_height: u32,
    default_format: PixelFormat,
    consumer_usage: BufferUsage,
    synchronous_mode: bool,
    allow_synchronous_mode: bool,
    sync_mode: SyncMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: String::from("unnamed"),
            buffer_count: 3,
            min_undequeued_buffers: 1,
            default_width: 1,
            default_height: 1,
            default_format: PixelFormat::RGBA_8888,
            consumer_usage: BufferUsage::HW_TEXTURE,
            synchronous_mode: false,
            allow_synchronous_mode: true,
            sync_mode: SyncMode::ImmediateFree,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Name of the queue, used to identify it in logs and dumps.
    pub fn name(self, name: impl Into<String>) -> Self {
        QueueConfig {
            name: name.into(),
            ..self
        }
    }

    /// Number of slots used until the producer or consumer ask for another
    /// count.
    pub fn buffer_count(self, buffer_count: usize) -> Self {
        QueueConfig {
            buffer_count,
            ..self
        }
    }

    /// Number of slots the producer is never allowed to have dequeued at the
    /// same time.
    pub fn min_undequeued_buffers(self, min_undequeued_buffers: usize) -> Self {
        QueueConfig {
            min_undequeued_buffers,
            ..self
        }
    }

    /// Size of the buffers allocated when the producer does not request one.
    pub fn default_size(self, width: u32, height: u32) -> Self {
        QueueConfig {
            default_width: width,
            default_height: height,
            ..self
        }
    }

    /// Format of the buffers allocated when the producer does not request one.
    pub fn default_format(self, default_format: PixelFormat) -> Self {
        QueueConfig {
            default_format,
            ..self
        }
    }

    /// Usage bits added to every allocation request.
    pub fn consumer_usage(self, consumer_usage: BufferUsage) -> Self {
        QueueConfig {
            consumer_usage,
            ..self
        }
    }

    /// Start the queue in synchronous mode, i.e. `dequeue` blocks instead of
    /// dropping queued frames.
    pub fn synchronous(self) -> Self {
        QueueConfig {
            synchronous_mode: true,
            ..self
        }
    }

    /// Prevent the producer from ever switching the queue to synchronous
    /// mode. Requests to do so are silently ignored.
    pub fn disallow_synchronous_mode(self) -> Self {
        QueueConfig {
            allow_synchronous_mode: false,
            synchronous_mode: false,
            ..self
        }
    }

    /// Make the consumer hand release fences over to the producer.
    pub fn fence_gated(self) -> Self {
        QueueConfig {
            sync_mode: SyncMode::FenceGated,
            ..self
        }
    }
}

/// Why a queue refuses to operate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotInitializedReason {
    /// The consumer has abandoned the queue. This is permanent.
    Abandoned,
    /// No producer is connected, or the producer has been disconnected while
    /// the operation was in progress.
    Disconnected,
}

impl fmt::Display for NotInitializedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotInitializedReason::Abandoned => "queue has been abandoned",
            NotInitializedReason::Disconnected => "no producer connected",
        })
    }
}

/// Errors returned by the producer and consumer operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    BadValue(&'static str),
    #[error("slot {0} is not a valid slot index")]
    BadIndex(usize),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("{0}")]
    NotInitialized(NotInitializedReason),
    #[error("queue is already connected to the {0} API")]
    AlreadyConnected(NativeWindowApi),
    #[error("buffer allocation failed: {0}")]
    OutOfMemory(#[from] AllocError),
    #[error("no buffer is currently available")]
    Busy,
}

/// Status code of an error, for callers that need to pass it across process
/// or language boundaries.
impl From<QueueError> for Errno {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::BadValue(_) => Errno::EINVAL,
            QueueError::BadIndex(_) => Errno::EOVERFLOW,
            QueueError::InvalidOperation(_) => Errno::ENOSYS,
            QueueError::NotInitialized(_) => Errno::ENODEV,
            QueueError::AlreadyConnected(_) => Errno::EEXIST,
            QueueError::OutOfMemory(AllocError::UnsupportedFormat(_)) => Errno::EINVAL,
            QueueError::OutOfMemory(_) => Errno::ENOMEM,
            QueueError::Busy => Errno::EBUSY,
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Information returned to the producer by `connect` and `queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBufferOutput {
    /// Default width of the buffers.
    pub width: u32,
    /// Default height of the buffers.
    pub height: u32,
    /// Transform the producer should pre-apply to its content for optimal
    /// composition.
    pub transform_hint: Transform,
    /// Number of frames waiting to be acquired by the consumer.
    pub num_pending_buffers: usize,
}

/// State shared between the producer and the consumer. Only accessed with
/// `BufferQueue::core` locked.
struct QueueCore<B: GraphicBuffer> {
    slots: SlotTable<B>,
    /// Queued slots waiting to be acquired, oldest first.
    fifo: VecDeque<usize>,
    /// Slot acquired last by the consumer. Its state remains `Queued` until
    /// the next acquisition replaces it.
    current: Option<usize>,
    /// Number of slots in use.
    buffer_count: usize,
    /// Buffer count requested by the producer, 0 if none.
    client_buffer_count: usize,
    /// Buffer count requested by the consumer. Only used while the producer
    /// has not requested one.
    server_buffer_count: usize,
    default_width: u32,
    default_height: u32,
    default_format: PixelFormat,
    consumer_usage: BufferUsage,
    transform_hint: Transform,
    connected_api: Option<NativeWindowApi>,
    /// Incremented on every new connection, so operations blocked across a
    /// disconnection can tell.
    connection_id: u64,
    synchronous_mode: bool,
    abandoned: bool,
    frame_counter: u64,
    last_timestamp: Option<i64>,
}

impl<B: GraphicBuffer> QueueCore<B> {
    fn check_abandoned(&self) -> QueueResult<()> {
        if self.abandoned {
            return Err(QueueError::NotInitialized(NotInitializedReason::Abandoned));
        }

        Ok(())
    }

    /// Make sure the queue can be used by a producer, and return the
    /// identifier of the current connection.
    fn check_connected(&self) -> QueueResult<u64> {
        self.check_abandoned()?;

        match self.connected_api {
            Some(_) => Ok(self.connection_id),
            None => Err(QueueError::NotInitialized(
                NotInitializedReason::Disconnected,
            )),
        }
    }

    /// Same as `check_connected`, but also fails if the connection is not the
    /// one identified by `connection_id`.
    fn check_connection(&self, connection_id: u64) -> QueueResult<()> {
        if self.check_connected()? != connection_id {
            return Err(QueueError::NotInitialized(
                NotInitializedReason::Disconnected,
            ));
        }

        Ok(())
    }

    /// Returns slot `index`, provided it is in use and currently dequeued by
    /// the producer.
    fn dequeued_slot_mut(&mut self, index: usize) -> QueueResult<&mut slot::BufferSlot<B>> {
        if index >= self.buffer_count {
            return Err(QueueError::BadIndex(index));
        }

        match self.slots.get_mut(index) {
            Some(slot) if slot.state == SlotState::Dequeued => Ok(slot),
            Some(_) => Err(QueueError::BadValue("slot is not dequeued")),
            None => Err(QueueError::BadIndex(index)),
        }
    }

    fn output(&self) -> QueueBufferOutput {
        QueueBufferOutput {
            width: self.default_width,
            height: self.default_height,
            transform_hint: self.transform_hint,
            num_pending_buffers: self.fifo.len(),
        }
    }

    /// Return every slot to the `Free` state without a buffer, forget all the
    /// pending frames and the consumer's current one. Returns the buffers
    /// that need to be given back to the allocator.
    fn reset_slots(&mut self) -> Vec<Arc<B>> {
        self.fifo.clear();
        self.current = None;
        self.slots.release_all()
    }
}

/// A queue of graphics buffers shared between one producer and one consumer.
///
/// The queue is meant to be shared behind an `Arc`: all its methods take
/// `&self`, and every change to the slots is serialized by a single internal
/// lock. The producer side is available through the `Producer` trait and
/// the consumer side through the `Consumer` trait.
pub struct BufferQueue<A: BufferAllocator> {
    name: String,
    allocator: A,
    min_undequeued_buffers: usize,
    allow_synchronous_mode: bool,
    sync_mode: SyncMode,
    core: Mutex<QueueCore<A::Buffer>>,
    /// Signaled every time a slot may have become available, or the queue
    /// state changed in a way that blocked producers must look at.
    dequeue_condition: Condvar,
    listener: Mutex<Option<Arc<dyn ConsumerListener>>>,
}

impl<A: BufferAllocator> BufferQueue<A> {
    /// Create a new queue that will obtain its buffers from `allocator`.
    /// No buffer is allocated until the producer dequeues slots.
    pub fn new(allocator: A, config: QueueConfig) -> QueueResult<Self> {
        if config.min_undequeued_buffers >= NUM_BUFFER_SLOTS {
            return Err(QueueError::BadValue("too many undequeued buffers"));
        }
        if config.buffer_count <= config.min_undequeued_buffers
            || config.buffer_count > NUM_BUFFER_SLOTS
        {
            return Err(QueueError::BadValue("buffer count out of range"));
        }
        if config.default_width == 0 || config.default_height == 0 {
            return Err(QueueError::BadValue("default size cannot be zero"));
        }

        debug!(
            "[{}] Creating queue with {} buffers ({}x{} {}, {:?})",
            config.name,
            config.buffer_count,
            config.default_width,
            config.default_height,
            config.default_format,
            config.sync_mode
        );

        Ok(BufferQueue {
            name: config.name,
            allocator,
            min_undequeued_buffers: config.min_undequeued_buffers,
            allow_synchronous_mode: config.allow_synchronous_mode,
            sync_mode: config.sync_mode,
            core: Mutex::new(QueueCore {
                slots: SlotTable::new(),
                fifo: VecDeque::with_capacity(NUM_BUFFER_SLOTS),
                current: None,
                buffer_count: config.buffer_count,
                client_buffer_count: 0,
                server_buffer_count: config.buffer_count,
                default_width: config.default_width,
                default_height: config.default_height,
                default_format: config.default_format,
                consumer_usage: config.consumer_usage,
                transform_hint: Transform::empty(),
                connected_api: None,
                connection_id: 0,
                synchronous_mode: config.synchronous_mode && config.allow_synchronous_mode,
                abandoned: false,
                frame_counter: 0,
                last_timestamp: None,
            }),
            dequeue_condition: Condvar::new(),
            listener: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn min_undequeued_buffers(&self) -> usize {
        self.min_undequeued_buffers
    }

    /// Number of slots currently in use.
    pub fn buffer_count(&self) -> usize {
        self.lock_core().buffer_count
    }

    /// Whether `dequeue` currently blocks instead of dropping frames.
    pub fn is_synchronous(&self) -> bool {
        self.lock_core().synchronous_mode
    }

    /// Number of frames queued by the producer and not yet acquired.
    pub fn num_pending_buffers(&self) -> usize {
        self.lock_core().fifo.len()
    }

    /// State of slot `index`, or `None` if the slot is not in use.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        let core = self.lock_core();
        if index >= core.buffer_count {
            return None;
        }
        core.slots.get(index).map(|s| s.state)
    }

    /// Returns whether slot `index` currently holds a buffer.
    pub fn slot_has_buffer(&self, index: usize) -> bool {
        self.lock_core()
            .slots
            .get(index)
            .map(|s| s.buffer.is_some())
            .unwrap_or(false)
    }

    /// Returns a human-readable description of the state of the queue.
    pub fn dump(&self) -> String {
        let core = self.lock_core();
        QueueDump { queue: self, core: &core }.to_string()
    }

    /// Smallest buffer count the producer or consumer can ask for.
    fn min_buffer_count(&self) -> usize {
        self.min_undequeued_buffers + 1
    }

    fn lock_core(&self) -> MutexGuard<'_, QueueCore<A::Buffer>> {
        self.core.lock().unwrap()
    }

    fn wait_for_slot<'a>(
        &self,
        guard: MutexGuard<'a, QueueCore<A::Buffer>>,
    ) -> MutexGuard<'a, QueueCore<A::Buffer>> {
        self.dequeue_condition.wait(guard).unwrap()
    }

    fn listener(&self) -> Option<Arc<dyn ConsumerListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// Give buffers detached from their slots back to the allocator.
    fn free_buffers(&self, buffers: Vec<Arc<A::Buffer>>) {
        if !buffers.is_empty() {
            debug!("[{}] Freeing {} buffers", self.name, buffers.len());
        }

        for buffer in buffers {
            self.allocator.free(buffer);
        }
    }
}

impl<A: BufferAllocator> Drop for BufferQueue<A> {
    fn drop(&mut self) {
        let buffers = match self.core.get_mut() {
            Ok(core) => core.reset_slots(),
            Err(poisoned) => poisoned.into_inner().reset_slots(),
        };
        self.free_buffers(buffers);
    }
}

struct QueueDump<'a, A: BufferAllocator> {
    queue: &'a BufferQueue<A>,
    core: &'a QueueCore<A::Buffer>,
}

impl<A: BufferAllocator> fmt::Display for QueueDump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core;

        writeln!(
            f,
            "[{}] {} mode, {:?}, {} buffers (client={}, server={}, min-undequeued={})",
            self.queue.name,
            if core.synchronous_mode {
                "synchronous"
            } else {
                "asynchronous"
            },
            self.queue.sync_mode,
            core.buffer_count,
            core.client_buffer_count,
            core.server_buffer_count,
            self.queue.min_undequeued_buffers,
        )?;
        writeln!(
            f,
            "  default {}x{} {}, usage {:?}, transform hint {:?}",
            core.default_width,
            core.default_height,
            core.default_format,
            core.consumer_usage,
            core.transform_hint,
        )?;
        match core.connected_api {
            Some(api) => writeln!(f, "  connected to {}", api)?,
            None => writeln!(f, "  not connected")?,
        }
        if core.abandoned {
            writeln!(f, "  ABANDONED")?;
        }
        writeln!(f, "  FIFO ({}): {:?}", core.fifo.len(), core.fifo)?;

        for (index, slot) in core.slots.iter(core.buffer_count) {
            let marker = if core.current == Some(index) { '>' } else { ' ' };
            write!(f, " {}[{:02}] state={:<8}", marker, index, slot.state.to_string())?;
            match &slot.buffer {
                Some(buffer) => {
                    let desc = buffer.descriptor();
                    write!(f, " {}x{} {}", desc.width, desc.height, desc.format)?;
                }
                None => write!(f, " (no buffer)")?,
            }
            if slot.state == SlotState::Queued {
                write!(
                    f,
                    " frame={} timestamp={} crop=[{}] transform={:?} scaling={:?}",
                    slot.frame_number, slot.timestamp, slot.crop, slot.transform, slot.scaling_mode
                )?;
            }
            if slot.fence.is_some() {
                write!(f, " fenced")?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
