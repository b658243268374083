//! Listener-to-poller wake-up channel.
//!
//! An eventfd that the poller keeps in its poll set. Writing to it forces
//! the poller out of `poll()` so it rebuilds its fd array on the next
//! cycle; this replaces the real-time-signal notification a classic
//! implementation would use, without any signal masking gymnastics.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::utility::sock;

pub struct PollWaker {
    fd: OwnedFd,
}

impl PollWaker {
    pub fn new() -> io::Result<PollWaker> {
        Ok(PollWaker {
            fd: sock::eventfd()?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Wake the poller. A saturated counter (`EAGAIN`) already implies a
    /// pending wake, so that outcome is ignored.
    pub fn wake(&self) {
        let one = 1u64.to_ne_bytes();
        if let Err(e) = sock::write(self.fd.as_raw_fd(), &one) {
            if !sock::is_transient(&e) {
                log::warn!("failed to wake the poller: {}", e);
            }
        }
    }

    /// Consume all pending wakes.
    pub fn drain(&self) {
        let mut counter = [0u8; 8];
        let _ = sock::read(self.fd.as_raw_fd(), &mut counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        sock::poll(&mut pfd, 0).unwrap() == 1
    }

    #[test]
    fn wake_then_drain() {
        let waker = PollWaker::new().unwrap();
        assert!(!readable(waker.as_raw_fd()));

        waker.wake();
        waker.wake();
        assert!(readable(waker.as_raw_fd()));

        waker.drain();
        assert!(!readable(waker.as_raw_fd()));
    }
}
