//! Fences gate the reuse of a buffer's memory by the producer.
//!
//! A `Fence` wraps a file descriptor that becomes readable once the work it
//! stands for (typically the consumer's GPU reads of a buffer) has completed,
//! like a Linux `sync_file`. Whether the queue tracks fences at all is decided
//! at runtime by its `SyncMode`.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::libc;
use thiserror::Error;

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

/// How a buffer released by the consumer becomes writable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// A buffer can be written as soon as its slot is free: the consumer is
    /// done with a buffer once it has acquired the next one.
    #[default]
    ImmediateFree,
    /// The consumer attaches a release fence to its current buffer, which is
    /// handed to the producer along with the slot. The producer must wait on
    /// it before writing into the buffer.
    FenceGated,
}

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("timeout while waiting for fence")]
    Timeout,
    #[error("fence is in an error state")]
    Error,
    #[error("error while polling fence: {0}")]
    Poll(#[from] io::Error),
}

/// A synchronization handle signaling the completion of a prior access to a
/// buffer.
#[derive(Debug)]
pub struct Fence {
    fd: OwnedFd,
}

impl Fence {
    pub fn new(fd: OwnedFd) -> Self {
        Fence { fd }
    }

    /// Returns whether the fence has signaled, without blocking.
    pub fn is_signaled(&self) -> Result<bool, FenceError> {
        match self.poll(0) {
            Ok(()) => Ok(true),
            Err(FenceError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Block until the fence signals or `timeout` expires. A `timeout` of
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), FenceError> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        self.poll(timeout_ms)
    }

    fn poll(&self, timeout_ms: libc::c_int) -> Result<(), FenceError> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            match syscall!(poll(&mut pollfd, 1, timeout_ms)) {
                Ok(0) => return Err(FenceError::Timeout),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FenceError::Poll(e)),
            }
        }

        if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(FenceError::Error);
        }

        Ok(())
    }
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Self {
        Fence::new(fd)
    }
}

impl From<Fence> for OwnedFd {
    fn from(fence: Fence) -> Self {
        fence.fd
    }
}

impl AsFd for Fence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Fence {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::io::Write;
    use std::os::unix::net::UnixStream;

    /// Returns a fence and the socket to write into in order to signal it.
    pub(crate) fn pending_fence() -> (Fence, UnixStream) {
        let (read_end, write_end) = UnixStream::pair().unwrap();
        (Fence::from(OwnedFd::from(read_end)), write_end)
    }

    #[test]
    fn test_fence_signal() {
        let (fence, mut signal) = pending_fence();
        assert!(!fence.is_signaled().unwrap());
        assert!(matches!(
            fence.wait(Some(Duration::from_millis(10))),
            Err(FenceError::Timeout)
        ));

        signal.write_all(&[1]).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.wait(None).unwrap();
    }

    #[test]
    fn test_fence_signaled_from_thread() {
        let (fence, mut signal) = pending_fence();

        let signaler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal.write_all(&[1]).unwrap();
        });

        fence.wait(Some(Duration::from_secs(5))).unwrap();
        signaler.join().unwrap();
    }
}
