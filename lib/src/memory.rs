//! Abstracts the allocation of the graphics buffers managed by a queue.
//!
//! The queue itself never allocates graphics memory. Instead, it asks a
//! `BufferAllocator` for a buffer matching a `BufferDescriptor` whenever a
//! dequeued slot has no buffer or a buffer that does not fit the producer's
//! request, and gives the buffer back to the allocator when the slot is
//! reset.
//!
//! Buffers are handed out to the producer and consumer as `Arc`s: the slot
//! keeps one reference, and the side currently holding the slot can obtain
//! another one. Allocators that need to know when the memory is really
//! unused can rely on their buffer type's `Drop` implementation, like
//! `HeapBuffer` does.
//!
//! The `GraphicBuffer` trait is implemented by the buffer type of an
//! allocator and lets the queue check whether a cached buffer can be reused
//! for a new request.
mod heap;

pub use heap::*;

use crate::PixelFormat;

use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// How a buffer is going to be accessed. The producer's requested usage
    /// is always extended with the consumer's usage bits before allocating.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const SW_READ_RARELY = 0x0000_0002;
        const SW_READ_OFTEN = 0x0000_0003;
        const SW_WRITE_RARELY = 0x0000_0020;
        const SW_WRITE_OFTEN = 0x0000_0030;
        const HW_TEXTURE = 0x0000_0100;
        const HW_RENDER = 0x0000_0200;
        const HW_2D = 0x0000_0400;
        const HW_COMPOSER = 0x0000_0800;
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::empty()
    }
}

/// Geometry, format and usage of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        BufferDescriptor {
            width,
            height,
            format,
            usage,
        }
    }

    /// Returns whether a buffer described by `self` can be used to satisfy
    /// `request`. The geometry and format must be identical, and the buffer
    /// must support at least all the requested usages.
    pub fn satisfies(&self, request: &BufferDescriptor) -> bool {
        self.width == request.width
            && self.height == request.height
            && self.format == request.format
            && self.usage.contains(request.usage)
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("pixel format {0} is not supported")]
    UnsupportedFormat(PixelFormat),
    #[error("not enough memory to allocate {0} bytes")]
    NoMem(usize),
    #[error("I/O error while allocating buffer: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for buffers produced by a `BufferAllocator`.
pub trait GraphicBuffer: Debug + Send + Sync + 'static {
    /// Description of the buffer, as it has been allocated.
    fn descriptor(&self) -> &BufferDescriptor;
}

/// Trait for the collaborator that provides the memory backing the buffers
/// of a queue.
///
/// Both methods are called with the queue's lock held, so they must return
/// promptly.
pub trait BufferAllocator: Send + Sync + 'static {
    type Buffer: GraphicBuffer;

    /// Allocate a new buffer matching `descriptor`.
    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<Self::Buffer, AllocError>;

    /// Give back a buffer previously returned by `allocate`. Other
    /// references to the buffer may still be alive, in which case the
    /// underlying memory must remain valid until they are dropped.
    fn free(&self, buffer: Arc<Self::Buffer>) {
        drop(buffer);
    }
}

/// Allocators can be shared between queues.
impl<A: BufferAllocator> BufferAllocator for Arc<A> {
    type Buffer = A::Buffer;

    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<Self::Buffer, AllocError> {
        self.as_ref().allocate(descriptor)
    }

    fn free(&self, buffer: Arc<Self::Buffer>) {
        self.as_ref().free(buffer)
    }
}
