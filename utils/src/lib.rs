//! Helpers shared by the example programs and tests of the `bufferqueue`
//! crate.
pub mod framegen;
pub mod memfd;

use std::io;

use bufferqueue::memory::{GraphicBuffer, HeapBuffer};

/// CPU access to the pixels of a buffer, for allocators that support it.
pub trait PixelAccess: GraphicBuffer {
    /// Copy `data` into the buffer, starting at its first byte.
    fn write_pixels(&self, data: &[u8]) -> io::Result<()>;

    /// Fill `data` with the content of the buffer, starting at its first
    /// byte.
    fn read_pixels(&self, data: &mut [u8]) -> io::Result<()>;
}

impl PixelAccess for HeapBuffer {
    fn write_pixels(&self, data: &[u8]) -> io::Result<()> {
        let mut pixels = self.lock_pixels();
        pixels
            .get_mut(0..data.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_pixels(&self, data: &mut [u8]) -> io::Result<()> {
        let pixels = self.lock_pixels();
        data.copy_from_slice(
            pixels
                .get(0..data.len())
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?,
        );
        Ok(())
    }
}
