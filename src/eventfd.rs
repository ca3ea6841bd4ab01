//! Event channel: a kernel-counted binary-signal file descriptor used for
//! driver→device kicks (queue doorbells) and device→driver interrupts
//! (irqfd).

use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

/// A counted semaphore over an eventfd. Each `signal` adds to the kernel
/// counter; each `drain` reads and zeroes it, returning `WouldBlock` if the
/// counter was already zero.
///
/// Owned exclusively by its creator and registered with the event loop as
/// read-only (kick channels, polled by the device) or write-only (irq
/// channels, signaled by the device).
pub struct EventChannel {
    fd: EventFd,
}

impl EventChannel {
    /// Create a new non-blocking event channel with counter zero.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            fd: EventFd::new(EFD_NONBLOCK)?,
        })
    }

    /// A duplicate file descriptor referring to the same kernel object, for
    /// handing to KVM (`ioeventfd`/`irqfd`) or `vhost-net` while retaining
    /// our own handle.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Add `n` to the counter.
    pub fn signal(&self, n: u64) -> std::io::Result<()> {
        self.fd.write(n)
    }

    /// Drain and return the counter. Returns `Err(WouldBlock)` if it was
    /// zero — the expected, non-fatal termination of a poll loop, not an
    /// error to propagate.
    pub fn drain(&self) -> std::io::Result<u64> {
        self.fd.read()
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain_returns_count() {
        let chan = EventChannel::new().unwrap();
        chan.signal(1).unwrap();
        chan.signal(2).unwrap();
        assert_eq!(chan.drain().unwrap(), 3);
    }

    #[test]
    fn drain_with_nothing_pending_would_block() {
        let chan = EventChannel::new().unwrap();
        let err = chan.drain().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
