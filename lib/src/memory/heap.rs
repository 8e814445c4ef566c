//! Allocator backing buffers with process memory.
//!
//! Heap buffers cannot be shared with another process, but they are enough
//! for producers and consumers living in the same process (e.g. a software
//! renderer feeding an encoder), and for testing.
use super::*;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Keeps track of the buffers allocated by a `HeapAllocator` that are still
/// alive, no matter who holds them.
#[derive(Default)]
struct HeapStats {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// A buffer allocated by `HeapAllocator`.
pub struct HeapBuffer {
    id: u64,
    descriptor: BufferDescriptor,
    pixels: Mutex<Vec<u8>>,
    stats: Arc<HeapStats>,
}

impl HeapBuffer {
    /// Unique identifier of the buffer within its allocator. Useful to check
    /// whether a slot has been reallocated.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.pixels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the pixel memory of the buffer for reading or writing.
    ///
    /// The queue does not synchronize access to the pixels: the producer may
    /// only write into a buffer it has dequeued, and the consumer may only
    /// read the buffer it has acquired.
    pub fn lock_pixels(&self) -> MutexGuard<'_, Vec<u8>> {
        self.pixels.lock().unwrap()
    }
}

impl Debug for HeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl GraphicBuffer for HeapBuffer {
    fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        let len = self
            .pixels
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        self.stats.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_sub(len, Ordering::Relaxed);
    }
}

/// Allocates zero-initialized buffers from the heap, optionally within a
/// memory budget.
#[derive(Default)]
pub struct HeapAllocator {
    budget: Option<usize>,
    next_id: AtomicU64,
    stats: Arc<HeapStats>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Create an allocator that fails with `AllocError::NoMem` once the live
    /// buffers would exceed `bytes`.
    pub fn with_budget(bytes: usize) -> Self {
        HeapAllocator {
            budget: Some(bytes),
            ..Default::default()
        }
    }

    /// Number of buffers allocated by this allocator that are still referenced.
    pub fn live_buffers(&self) -> usize {
        self.stats.live_buffers.load(Ordering::Relaxed)
    }

    /// Number of bytes used by the buffers counted in `live_buffers`.
    pub fn live_bytes(&self) -> usize {
        self.stats.live_bytes.load(Ordering::Relaxed)
    }

    /// Total number of buffers allocated since the creation of the allocator.
    pub fn num_allocations(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for HeapAllocator {
    type Buffer = HeapBuffer;

    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<HeapBuffer, AllocError> {
        let size = descriptor
            .format
            .frame_size(descriptor.width, descriptor.height)
            .ok_or(AllocError::UnsupportedFormat(descriptor.format))?;

        if let Some(budget) = self.budget {
            if self.live_bytes() + size > budget {
                return Err(AllocError::NoMem(size));
            }
        }

        self.stats.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_add(size, Ordering::Relaxed);

        Ok(HeapBuffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            descriptor: *descriptor,
            pixels: Mutex::new(vec![0u8; size]),
            stats: Arc::clone(&self.stats),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_stats() {
        let allocator = HeapAllocator::new();
        let desc = BufferDescriptor::new(16, 8, PixelFormat::RGBA_8888, BufferUsage::empty());

        let a = allocator.allocate(&desc).unwrap();
        let b = Arc::new(allocator.allocate(&desc).unwrap());
        assert_eq!(a.len(), 16 * 8 * 4);
        assert_ne!(a.id(), b.id());
        assert_eq!(allocator.live_buffers(), 2);
        assert_eq!(allocator.live_bytes(), 2 * 16 * 8 * 4);

        drop(a);
        assert_eq!(allocator.live_buffers(), 1);

        // Freeing does not invalidate other references.
        let b2 = Arc::clone(&b);
        allocator.free(b);
        assert_eq!(allocator.live_buffers(), 1);
        b2.lock_pixels()[0] = 0xff;
        drop(b2);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.live_bytes(), 0);
        assert_eq!(allocator.num_allocations(), 2);
    }

    #[test]
    fn test_heap_allocator_budget() {
        let allocator = HeapAllocator::with_budget(1024);
        let desc = BufferDescriptor::new(16, 8, PixelFormat::RGBA_8888, BufferUsage::empty());

        let a = allocator.allocate(&desc).unwrap();
        let b = allocator.allocate(&desc).unwrap();
        assert!(matches!(
            allocator.allocate(&desc),
            Err(AllocError::NoMem(512))
        ));

        drop(a);
        assert!(allocator.allocate(&desc).is_ok());
        drop(b);
    }

    #[test]
    fn test_heap_buffer_poisoned_drop() {
        let allocator = HeapAllocator::with_budget(1024);
        let desc = BufferDescriptor::new(16, 8, PixelFormat::RGBA_8888, BufferUsage::empty());
        let buffer = Arc::new(allocator.allocate(&desc).unwrap());

        let writer = Arc::clone(&buffer);
        let res = std::thread::spawn(move || {
            let _pixels = writer.lock_pixels();
            panic!("writer crashed");
        })
        .join();
        assert!(res.is_err());
        assert!(buffer.pixels.is_poisoned());

        drop(buffer);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.live_bytes(), 0);
        // The whole budget is available again.
        let a = allocator.allocate(&desc).unwrap();
        let b = allocator.allocate(&desc).unwrap();
        drop((a, b));
    }

    #[test]
    fn test_heap_allocator_unsupported_format() {
        let allocator = HeapAllocator::new();
        let desc = BufferDescriptor::new(16, 8, PixelFormat::from(0x108), BufferUsage::empty());

        assert!(matches!(
            allocator.allocate(&desc),
            Err(AllocError::UnsupportedFormat(_))
        ));
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn test_descriptor_satisfies() {
        let cached = BufferDescriptor::new(
            64,
            64,
            PixelFormat::RGBA_8888,
            BufferUsage::HW_TEXTURE | BufferUsage::SW_WRITE_OFTEN,
        );

        assert!(cached.satisfies(&BufferDescriptor::new(
            64,
            64,
            PixelFormat::RGBA_8888,
            BufferUsage::HW_TEXTURE
        )));
        assert!(!cached.satisfies(&BufferDescriptor::new(
            64,
            32,
            PixelFormat::RGBA_8888,
            BufferUsage::HW_TEXTURE
        )));
        assert!(!cached.satisfies(&BufferDescriptor::new(
            64,
            64,
            PixelFormat::RGB_565,
            BufferUsage::HW_TEXTURE
        )));
        assert!(!cached.satisfies(&BufferDescriptor::new(
            64,
            64,
            PixelFormat::RGBA_8888,
            BufferUsage::HW_COMPOSER
        )));
    }
}
