//! Module for creating and using buffer queues from C.
//!
//! Queues are created using [`bufq_queue_new`] and remain alive until being
//! given to [`bufq_queue_destroy`]. Both the producer and the consumer use
//! the same queue pointer, possibly from different threads.
//!
//! Unless stated otherwise, functions return 0 on success and a negative
//! `errno` value on failure.
#![allow(non_camel_case_types)]

use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex};

use bufferqueue::memory::{BufferUsage, GraphicBuffer};
use bufferqueue::{
    BufferItem, BufferQueue, Consumer, ConsumerListener, Fence, NativeWindowApi, PixelFormat,
    Producer, QueryKind, QueueBufferInput, QueueBufferOutput, QueueConfig, QueueError, Rect,
    ScalingMode, Transform,
};
use bufferqueue_utils::memfd::{MemfdAllocator, MemfdBuffer};
use log::{debug, error, warn};
use nix::errno::Errno;

/// A buffer queue instance.
pub struct bufq_queue {
    queue: BufferQueue<MemfdAllocator>,
    /// Keeps the buffer of the consumer's current frame alive, so its file
    /// descriptor remains valid until the next acquisition.
    current: Mutex<Option<BufferItem<MemfdBuffer>>>,
}

/// Parameters of a new queue.
#[repr(C)]
pub struct bufq_config {
    pub buffer_count: u32,
    pub min_undequeued_buffers: u32,
    pub default_width: u32,
    pub default_height: u32,
    pub default_format: u32,
    pub consumer_usage: u32,
    pub synchronous: bool,
    pub fence_gated: bool,
}

#[repr(C)]
#[derive(Default)]
pub struct bufq_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl From<Rect> for bufq_rect {
    fn from(rect: Rect) -> Self {
        bufq_rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl From<&bufq_rect> for Rect {
    fn from(rect: &bufq_rect) -> Self {
        Rect::new(rect.left, rect.top, rect.width, rect.height)
    }
}

/// Information returned by [`bufq_connect`] and [`bufq_queue_buffer`].
#[repr(C)]
#[derive(Default)]
pub struct bufq_queue_output {
    pub width: u32,
    pub height: u32,
    pub transform_hint: u32,
    pub num_pending_buffers: u32,
}

impl From<QueueBufferOutput> for bufq_queue_output {
    fn from(output: QueueBufferOutput) -> Self {
        bufq_queue_output {
            width: output.width,
            height: output.height,
            transform_hint: output.transform_hint.bits(),
            num_pending_buffers: output.num_pending_buffers as u32,
        }
    }
}

/// Slot obtained by [`bufq_dequeue`].
#[repr(C)]
pub struct bufq_dequeue_output {
    pub slot: u32,
    /// Fence to wait on before writing into the buffer, or -1. The caller
    /// takes ownership of the file descriptor.
    pub fence_fd: c_int,
    /// `DequeueFlags` of the operation.
    pub flags: u32,
}

/// Buffer returned by [`bufq_request_buffer`].
#[repr(C)]
pub struct bufq_buffer_info {
    /// memfd holding the pixels. Owned by the queue and valid until the slot
    /// is reallocated or all buffers are released.
    pub fd: c_int,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub usage: u32,
}

impl bufq_buffer_info {
    fn new(buffer: &MemfdBuffer) -> Self {
        let desc = buffer.descriptor();
        bufq_buffer_info {
            fd: buffer.as_fd().as_raw_fd(),
            size: buffer.size(),
            width: desc.width,
            height: desc.height,
            format: desc.format.to_u32(),
            usage: desc.usage.bits(),
        }
    }
}

/// Metadata of a frame passed to [`bufq_queue_buffer`].
#[repr(C)]
pub struct bufq_queue_input {
    pub timestamp: i64,
    /// An empty rectangle selects the whole buffer.
    pub crop: bufq_rect,
    pub scaling_mode: u32,
    pub transform: u32,
}

/// Frame acquired by [`bufq_acquire_next`].
#[repr(C)]
pub struct bufq_buffer_item {
    pub slot: u32,
    pub buffer: bufq_buffer_info,
    pub crop: bufq_rect,
    pub transform: u32,
    pub scaling_mode: u32,
    pub timestamp: i64,
    pub frame_number: u64,
}

/// Callback invoked every time a new frame is queued. It is never called with
/// the queue locked, so it can call back into the queue.
pub type bufq_frame_available_cb = extern "C" fn(*mut c_void);

// A void pointer that can be sent across threads. The client is responsible
// for making the callback data usable from the producer's thread.
struct SendablePtr<T>(*mut T);
unsafe impl<T> Send for SendablePtr<T> {}
unsafe impl<T> Sync for SendablePtr<T> {}

struct FrameAvailableListener {
    cb: bufq_frame_available_cb,
    cb_data: SendablePtr<c_void>,
}

impl ConsumerListener for FrameAvailableListener {
    fn on_frame_available(&self) {
        (self.cb)(self.cb_data.0)
    }
}

fn errno(e: QueueError) -> c_int {
    debug!("Returning error: {}", e);
    -(Errno::from(e) as c_int)
}

fn einval() -> c_int {
    -(Errno::EINVAL as c_int)
}

fn api_from_raw(api: u32) -> Option<NativeWindowApi> {
    let api = NativeWindowApi::n(api);
    if api.is_none() {
        warn!("Invalid producer API");
    }
    api
}

fn bufq_queue_new_safe(config: &bufq_config) -> *mut bufq_queue {
    let mut queue_config = QueueConfig::new()
        .buffer_count(config.buffer_count as usize)
        .min_undequeued_buffers(config.min_undequeued_buffers as usize)
        .default_size(config.default_width, config.default_height)
        .default_format(PixelFormat::from(config.default_format))
        .consumer_usage(BufferUsage::from_bits_truncate(config.consumer_usage));
    if config.synchronous {
        queue_config = queue_config.synchronous();
    }
    if config.fence_gated {
        queue_config = queue_config.fence_gated();
    }

    let queue = match BufferQueue::new(MemfdAllocator::new(), queue_config) {
        Ok(queue) => queue,
        Err(e) => {
            error!("Failed to create queue: {}", e);
            return std::ptr::null_mut();
        }
    };

    let queue = Box::new(bufq_queue {
        queue,
        current: Mutex::new(None),
    });
    debug!("Queue {:p}: created", queue.as_ref());

    Box::into_raw(queue)
}

/// Create a new queue.
///
/// Returns NULL if `config` is invalid.
///
/// # Safety
///
/// `config` must be a valid pointer to a `bufq_config`.
#[no_mangle]
pub unsafe extern "C" fn bufq_queue_new(config: *const bufq_config) -> *mut bufq_queue {
    match config.as_ref() {
        Some(config) => bufq_queue_new_safe(config),
        None => std::ptr::null_mut(),
    }
}

/// Destroy a queue and free all its buffers.
///
/// # Safety
///
/// `queue` must be a valid pointer returned by [`bufq_queue_new`], or NULL.
/// It must not be used again after this function is called.
#[no_mangle]
pub unsafe extern "C" fn bufq_queue_destroy(queue: *mut bufq_queue) {
    if queue.is_null() {
        warn!("Trying to destroy a NULL queue");
        return;
    }

    debug!("Queue {:p}: destroying", queue);
    drop(Box::from_raw(queue));
}

/// Connect producer `api` to the queue. `output` may be NULL.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `output`, if not NULL, must point
/// to writable memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_connect(
    queue: *const bufq_queue,
    api: u32,
    output: *mut bufq_queue_output,
) -> c_int {
    let queue = &*queue;
    let api = match api_from_raw(api) {
        Some(api) => api,
        None => return einval(),
    };

    match queue.queue.connect(api) {
        Ok(out) => {
            if let Some(output) = output.as_mut() {
                *output = out.into();
            }
            0
        }
        Err(e) => errno(e),
    }
}

/// Disconnect producer `api` from the queue.
///
/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_disconnect(queue: *const bufq_queue, api: u32) -> c_int {
    let queue = &*queue;
    let api = match api_from_raw(api) {
        Some(api) => api,
        None => return einval(),
    };

    match queue.queue.disconnect(api) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// Set the number of slots used by the queue, or 0 to let the consumer
/// decide.
///
/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_set_buffer_count(queue: *const bufq_queue, count: u32) -> c_int {
    match (*queue).queue.set_buffer_count(count as usize) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_set_synchronous_mode(
    queue: *const bufq_queue,
    enabled: bool,
) -> c_int {
    match (*queue).queue.set_synchronous_mode(enabled) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// Dequeue a slot for a `width`x`height` buffer. Zero sizes and a zero
/// format select the defaults of the queue. This blocks in synchronous mode.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `output` must point to writable
/// memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_dequeue(
    queue: *const bufq_queue,
    width: u32,
    height: u32,
    format: u32,
    usage: u32,
    output: *mut bufq_dequeue_output,
) -> c_int {
    let queue = &*queue;
    let output = match output.as_mut() {
        Some(output) => output,
        None => return einval(),
    };

    match queue.queue.dequeue(
        width,
        height,
        PixelFormat::from(format),
        BufferUsage::from_bits_truncate(usage),
    ) {
        Ok(dequeued) => {
            *output = bufq_dequeue_output {
                slot: dequeued.slot as u32,
                fence_fd: dequeued
                    .fence
                    .map(|f| OwnedFd::from(f).into_raw_fd())
                    .unwrap_or(-1),
                flags: dequeued.flags.bits(),
            };
            0
        }
        Err(e) => errno(e),
    }
}

/// Obtain the buffer of dequeued slot `slot`.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `info` must point to writable
/// memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_request_buffer(
    queue: *const bufq_queue,
    slot: u32,
    info: *mut bufq_buffer_info,
) -> c_int {
    let queue = &*queue;
    let info = match info.as_mut() {
        Some(info) => info,
        None => return einval(),
    };

    match queue.queue.request_buffer(slot as usize) {
        Ok(buffer) => {
            *info = bufq_buffer_info::new(&buffer);
            0
        }
        Err(e) => errno(e),
    }
}

/// Queue dequeued slot `slot`. `output` may be NULL.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `input` must point to a valid
/// `bufq_queue_input`. `output`, if not NULL, must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_queue_buffer(
    queue: *const bufq_queue,
    slot: u32,
    input: *const bufq_queue_input,
    output: *mut bufq_queue_output,
) -> c_int {
    let queue = &*queue;
    let input = match input.as_ref() {
        Some(input) => input,
        None => return einval(),
    };
    let scaling_mode = match ScalingMode::n(input.scaling_mode) {
        Some(mode) => mode,
        None => return einval(),
    };

    let input = QueueBufferInput::new(input.timestamp)
        .crop(Rect::from(&input.crop))
        .scaling_mode(scaling_mode)
        .transform(Transform::from_bits_truncate(input.transform));

    match queue.queue.queue(slot as usize, input) {
        Ok(out) => {
            if let Some(output) = output.as_mut() {
                *output = out.into();
            }
            0
        }
        Err(e) => errno(e),
    }
}

/// Return dequeued slot `slot` without queuing it.
///
/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_cancel(queue: *const bufq_queue, slot: u32) -> c_int {
    match (*queue).queue.cancel(slot as usize) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// Query property `what` (a `QueryKind` value) and write it into `value`.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `value` must point to writable
/// memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_query(queue: *const bufq_queue, what: u32, value: *mut u32) -> c_int {
    let queue = &*queue;
    let (what, value) = match (QueryKind::n(what), value.as_mut()) {
        (Some(what), Some(value)) => (what, value),
        _ => return einval(),
    };

    match queue.queue.query(what) {
        Ok(v) => {
            *value = v;
            0
        }
        Err(e) => errno(e),
    }
}

/// Acquire the next pending frame.
///
/// Returns 1 if a frame has been written into `item`, 0 if no frame was
/// pending, or a negative `errno` value. The buffer of the acquired frame
/// remains valid until the next successful call.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `item` must point to writable
/// memory.
#[no_mangle]
pub unsafe extern "C" fn bufq_acquire_next(
    queue: *const bufq_queue,
    item: *mut bufq_buffer_item,
) -> c_int {
    let queue = &*queue;
    let item = match item.as_mut() {
        Some(item) => item,
        None => return einval(),
    };

    match queue.queue.acquire_next() {
        Ok(Some(acquired)) => {
            *item = bufq_buffer_item {
                slot: acquired.slot as u32,
                buffer: bufq_buffer_info::new(&acquired.buffer),
                crop: acquired.crop.into(),
                transform: acquired.transform.bits(),
                scaling_mode: acquired.scaling_mode as u32,
                timestamp: acquired.timestamp,
                frame_number: acquired.frame_number,
            };
            *queue.current.lock().unwrap() = Some(acquired);
            1
        }
        Ok(None) => 0,
        Err(e) => errno(e),
    }
}

/// Attach a release fence to the current frame. The queue takes ownership of
/// `fence_fd`, even on failure.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `fence_fd` must be an open file
/// descriptor owned by the caller.
#[no_mangle]
pub unsafe extern "C" fn bufq_set_release_fence(
    queue: *const bufq_queue,
    fence_fd: c_int,
) -> c_int {
    if fence_fd < 0 {
        return einval();
    }

    let fence = Fence::from(OwnedFd::from_raw_fd(fence_fd));
    match (*queue).queue.set_release_fence(fence) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_set_buffer_count_server(
    queue: *const bufq_queue,
    count: u32,
) -> c_int {
    match (*queue).queue.set_buffer_count_server(count as usize) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// Register `cb` to be called with `cb_data` every time a frame is queued.
/// Passing NULL as `cb` unregisters the current callback.
///
/// # Safety
///
/// `queue` must be a valid queue pointer. `cb_data` must remain valid for as
/// long as the callback is registered.
#[no_mangle]
pub unsafe extern "C" fn bufq_set_frame_available_cb(
    queue: *const bufq_queue,
    cb: Option<bufq_frame_available_cb>,
    cb_data: *mut c_void,
) {
    let listener = cb.map(|cb| {
        Arc::new(FrameAvailableListener {
            cb,
            cb_data: SendablePtr(cb_data),
        }) as Arc<dyn ConsumerListener>
    });

    (*queue).queue.set_listener(listener);
}

/// Abandon the queue. Every further operation on it fails with `-ENODEV`.
///
/// # Safety
///
/// `queue` must be a valid queue pointer.
#[no_mangle]
pub unsafe extern "C" fn bufq_abandon(queue: *const bufq_queue) {
    let queue = &*queue;
    queue.queue.abandon();
    queue.current.lock().unwrap().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_queue() -> *mut bufq_queue {
        let config = bufq_config {
            buffer_count: 3,
            min_undequeued_buffers: 1,
            default_width: 8,
            default_height: 8,
            default_format: PixelFormat::RGBA_8888.to_u32(),
            consumer_usage: 0,
            synchronous: false,
            fence_gated: false,
        };
        unsafe { bufq_queue_new(&config) }
    }

    extern "C" fn count_frames(data: *mut c_void) {
        let counter = unsafe { &*(data as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_invalid_config() {
        let config = bufq_config {
            buffer_count: 1,
            min_undequeued_buffers: 1,
            default_width: 8,
            default_height: 8,
            default_format: 1,
            consumer_usage: 0,
            synchronous: false,
            fence_gated: false,
        };
        assert!(unsafe { bufq_queue_new(&config) }.is_null());
    }

    #[test]
    fn test_produce_and_consume() {
        let queue = new_queue();
        assert!(!queue.is_null());
        let frames = AtomicUsize::new(0);

        unsafe {
            bufq_set_frame_available_cb(
                queue,
                Some(count_frames),
                &frames as *const AtomicUsize as *mut c_void,
            );

            let mut out = bufq_queue_output::default();
            assert_eq!(bufq_connect(queue, 2, &mut out), 0);
            assert_eq!((out.width, out.height), (8, 8));
            assert_eq!(bufq_connect(queue, 1, &mut out), -(Errno::EEXIST as c_int));
            assert_eq!(bufq_connect(queue, 42, &mut out), -(Errno::EINVAL as c_int));

            let mut dequeued = bufq_dequeue_output {
                slot: 0,
                fence_fd: 0,
                flags: 0,
            };
            assert_eq!(bufq_dequeue(queue, 0, 0, 0, 0, &mut dequeued), 0);
            assert_eq!(dequeued.fence_fd, -1);

            let mut info = std::mem::zeroed::<bufq_buffer_info>();
            assert_eq!(bufq_request_buffer(queue, dequeued.slot, &mut info), 0);
            assert_eq!(info.size, 8 * 8 * 4);
            assert!(info.fd >= 0);
            assert_eq!(
                bufq_request_buffer(queue, 40, &mut info),
                -(Errno::EOVERFLOW as c_int)
            );

            let input = bufq_queue_input {
                timestamp: 33,
                crop: Default::default(),
                scaling_mode: 0,
                transform: 0,
            };
            assert_eq!(
                bufq_queue_buffer(queue, dequeued.slot, &input, std::ptr::null_mut()),
                0
            );
            assert_eq!(frames.load(Ordering::SeqCst), 1);

            let mut item = std::mem::zeroed::<bufq_buffer_item>();
            assert_eq!(bufq_acquire_next(queue, &mut item), 1);
            assert_eq!(item.timestamp, 33);
            assert_eq!(item.frame_number, 1);
            assert_eq!((item.crop.width, item.crop.height), (8, 8));
            assert_eq!(bufq_acquire_next(queue, &mut item), 0);

            bufq_set_frame_available_cb(queue, None, std::ptr::null_mut());
            bufq_abandon(queue);
            assert_eq!(
                bufq_dequeue(queue, 0, 0, 0, 0, &mut dequeued),
                -(Errno::ENODEV as c_int)
            );

            bufq_queue_destroy(queue);
        }
    }
}
