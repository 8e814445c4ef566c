//! Allocator backing buffers with anonymous memory files.
//!
//! Unlike heap buffers, memfd buffers can be shared with another process by
//! passing their file descriptor.
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bufferqueue::memory::{AllocError, BufferAllocator, BufferDescriptor, GraphicBuffer};
use log::trace;
use nix::libc;

use crate::PixelAccess;

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

const MEMFD_NAME: &[u8] = b"bufferqueue\0";

#[derive(Debug)]
pub struct MemfdBuffer {
    descriptor: BufferDescriptor,
    file: File,
    size: usize,
}

impl MemfdBuffer {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl GraphicBuffer for MemfdBuffer {
    fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }
}

impl AsFd for MemfdBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl PixelAccess for MemfdBuffer {
    fn write_pixels(&self, data: &[u8]) -> io::Result<()> {
        if data.len() > self.size {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        self.file.write_all_at(data, 0)
    }

    fn read_pixels(&self, data: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(data, 0)
    }
}

/// Allocates buffers as anonymous memory files.
#[derive(Default)]
pub struct MemfdAllocator {
    num_allocations: AtomicUsize,
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn num_allocations(&self) -> usize {
        self.num_allocations.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for MemfdAllocator {
    type Buffer = MemfdBuffer;

    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<MemfdBuffer, AllocError> {
        let size = descriptor
            .format
            .frame_size(descriptor.width, descriptor.height)
            .ok_or(AllocError::UnsupportedFormat(descriptor.format))?;

        let fd = syscall!(memfd_create(
            MEMFD_NAME.as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC
        ))?;
        // Safe because we just created the descriptor and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)?;

        self.num_allocations.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Allocated memfd buffer of {} bytes for {}x{} {}",
            size,
            descriptor.width,
            descriptor.height,
            descriptor.format
        );

        Ok(MemfdBuffer {
            descriptor: *descriptor,
            file,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bufferqueue::memory::BufferUsage;
    use bufferqueue::PixelFormat;

    #[test]
    fn test_memfd_allocate() {
        let allocator = MemfdAllocator::new();
        let desc = BufferDescriptor::new(4, 4, PixelFormat::RGB_565, BufferUsage::SW_WRITE_OFTEN);
        let buffer = allocator.allocate(&desc).unwrap();
        assert_eq!(buffer.size(), 32);
        assert_eq!(buffer.descriptor(), &desc);
        assert_eq!(allocator.num_allocations(), 1);

        let data: Vec<u8> = (0..32).collect();
        buffer.write_pixels(&data).unwrap();
        let mut read = vec![0u8; 32];
        buffer.read_pixels(&mut read).unwrap();
        assert_eq!(read, data);

        assert!(buffer.write_pixels(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_memfd_unsupported_format() {
        let allocator = MemfdAllocator::new();
        let desc = BufferDescriptor::new(4, 4, PixelFormat::NONE, BufferUsage::empty());
        assert!(matches!(
            allocator.allocate(&desc),
            Err(AllocError::UnsupportedFormat(_))
        ));
    }
}
