//! One socket-anchored half of a proxied connection, and the splice
//! operation that shuttles bytes between two of them.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bitflags::bitflags;

use crate::proxy::buffer::{RingBuf, PROXY_BUF_SIZE};
use crate::utility::sock;

bitflags! {
    /// Transient and terminal I/O conditions observed during a splice
    /// sweep. READ_DONE/WRITE_DONE/EOF are cleared by the poller when it
    /// reaps a worked descriptor; ERROR is terminal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u8 {
        const READ_DONE = 1 << 0;
        const WRITE_DONE = 1 << 1;
        const ERROR = 1 << 2;
        const EOF = 1 << 3;
    }
}

bitflags! {
    /// Poll interest and readiness bits, matching the kernel's `poll(2)`
    /// event encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: libc::c_short {
        const IN = libc::POLLIN;
        const OUT = libc::POLLOUT;
        const HUP = libc::POLLHUP;
        const ERR = libc::POLLERR;
        const NVAL = libc::POLLNVAL;
    }
}

impl PollEvents {
    /// Hangup/error/invalid are reported by the kernel regardless of the
    /// requested events; carrying them in every interest mask documents
    /// that they are always armed.
    pub const ALWAYS_ON: PollEvents = PollEvents::HUP
        .union(PollEvents::ERR)
        .union(PollEvents::NVAL);

    pub const FATAL: PollEvents = Self::ALWAYS_ON;
}

pub struct Endpoint {
    fd: Option<OwnedFd>,
    pub iostat: IoFlags,
    pub interest: PollEvents,
    pub buf: Option<RingBuf>,
}

impl Endpoint {
    pub fn new() -> Endpoint {
        Endpoint {
            fd: None,
            iostat: IoFlags::empty(),
            interest: PollEvents::ALWAYS_ON,
            buf: None,
        }
    }

    pub fn attach(&mut self, fd: OwnedFd) {
        debug_assert!(self.fd.is_none(), "endpoint fd attached twice");
        self.fd = Some(fd);
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Bring the endpoint onto the data plane: allocate its buffer and arm
    /// read interest. Called exactly once, on the open transition.
    pub fn arm_data_plane(&mut self) {
        debug_assert!(self.buf.is_none(), "endpoint buffer initialised twice");
        self.buf = Some(RingBuf::new(PROXY_BUF_SIZE));
        self.interest.insert(PollEvents::IN);
    }

    /// Release the fd and buffer. The fd is switched back to blocking mode
    /// first, giving the kernel a chance to flush queued data before the
    /// close sends FIN.
    pub fn teardown(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = sock::set_nonblocking(fd.as_raw_fd(), false);
        }
        self.buf = None;
    }

    pub fn clear_transients(&mut self) {
        self.iostat
            .remove(IoFlags::READ_DONE | IoFlags::WRITE_DONE | IoFlags::EOF);
    }

    fn buf_full(&self) -> bool {
        self.buf.as_ref().is_some_and(|b| b.is_full())
    }

    pub fn buf_empty(&self) -> bool {
        self.buf.as_ref().map_or(true, |b| b.is_empty())
    }

    /// Receive from this endpoint's socket into its buffer. Returns the
    /// number of bytes moved; zero also covers every no-progress outcome
    /// recorded in `iostat`.
    fn receive(&mut self) -> usize {
        if self
            .iostat
            .intersects(IoFlags::READ_DONE | IoFlags::ERROR | IoFlags::EOF)
            || self.buf_full()
        {
            return 0;
        }
        let Some(fd) = self.raw_fd() else { return 0 };
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };

        match sock::read(fd, buf.fill_slice()) {
            Ok(0) => {
                self.iostat.insert(IoFlags::EOF);
                0
            }
            Ok(n) => {
                buf.advance_fill(n);
                n
            }
            Err(e) if sock::is_transient(&e) => {
                self.iostat.insert(IoFlags::READ_DONE);
                0
            }
            Err(_) => {
                self.iostat.insert(IoFlags::ERROR);
                0
            }
        }
    }

    /// Send buffered bytes to the peer's fd. Mirrors [`Self::receive`].
    fn send_to(&mut self, to_fd: RawFd) -> usize {
        if self
            .iostat
            .intersects(IoFlags::WRITE_DONE | IoFlags::ERROR)
            || self.buf_empty()
        {
            return 0;
        }
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };

        match sock::write(to_fd, buf.drain_slice()) {
            Ok(n) => {
                buf.advance_drain(n);
                n
            }
            Err(e) if sock::is_transient(&e) => {
                self.iostat.insert(IoFlags::WRITE_DONE);
                0
            }
            Err(_) => {
                self.iostat.insert(IoFlags::ERROR);
                0
            }
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new()
    }
}

/// Shuttle bytes one direction: receive into `from`'s buffer and send from
/// it to `to`'s fd, sweeping until neither side progresses, then re-arm
/// the poll interests for the next cycle.
pub fn splice(from: &mut Endpoint, to: &mut Endpoint) {
    loop {
        let received = from.receive();
        let sent = match to.raw_fd() {
            Some(to_fd) => from.send_to(to_fd),
            None => 0,
        };
        if received == 0 && sent == 0 {
            break;
        }
    }

    if from.iostat.contains(IoFlags::ERROR) {
        return;
    }

    // No buffer space, or the peer finished sending: stop watching for
    // incoming data on this side.
    if from.buf_full() || from.iostat.contains(IoFlags::EOF) {
        from.interest.remove(PollEvents::IN);
    } else if from.iostat.contains(IoFlags::READ_DONE) {
        from.interest.insert(PollEvents::IN);
    }

    // Everything buffered was transmitted: stop waiting for writability
    // on the outgoing side.
    if from.buf_empty() {
        to.interest.remove(PollEvents::OUT);
    } else {
        to.interest.insert(PollEvents::OUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A spliceable endpoint pair over a unix socketpair; returns the two
    /// endpoints plus the far ends the test drives.
    fn plumbing() -> (Endpoint, Endpoint, OwnedFd, OwnedFd) {
        let (src_near, src_far) = sock::socketpair_stream().unwrap();
        let (dst_near, dst_far) = sock::socketpair_stream().unwrap();
        for fd in [&src_near, &dst_near] {
            sock::set_nonblocking(fd.as_raw_fd(), true).unwrap();
        }

        let mut src = Endpoint::new();
        src.attach(src_near);
        src.arm_data_plane();
        let mut dst = Endpoint::new();
        dst.attach(dst_near);
        dst.arm_data_plane();

        (src, dst, src_far, dst_far)
    }

    #[test]
    fn forwards_bytes() {
        let (mut src, mut dst, src_far, dst_far) = plumbing();

        sock::write(src_far.as_raw_fd(), b"HELLO").unwrap();
        splice(&mut src, &mut dst);

        let mut buf = [0u8; 16];
        let n = sock::read(dst_far.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLO");

        // drained fully: no pending write interest, read re-armed
        assert!(src.buf_empty());
        assert!(!dst.interest.contains(PollEvents::OUT));
        assert!(src.interest.contains(PollEvents::IN));
    }

    #[test]
    fn idle_sweep_records_read_done() {
        let (mut src, mut dst, _src_far, _dst_far) = plumbing();

        splice(&mut src, &mut dst);
        assert!(src.iostat.contains(IoFlags::READ_DONE));
        assert!(!src.iostat.contains(IoFlags::ERROR));
        assert!(!src.iostat.contains(IoFlags::EOF));
    }

    #[test]
    fn eof_disarms_read() {
        let (mut src, mut dst, src_far, _dst_far) = plumbing();

        drop(src_far);
        splice(&mut src, &mut dst);

        assert!(src.iostat.contains(IoFlags::EOF));
        assert!(!src.interest.contains(PollEvents::IN));
        assert!(src.buf_empty());
    }

    #[test]
    fn eof_after_data_keeps_buffered_bytes() {
        let (mut src, mut dst, src_far, dst_far) = plumbing();

        sock::write(src_far.as_raw_fd(), b"tail").unwrap();
        drop(src_far);
        splice(&mut src, &mut dst);

        // data still flowed through before the EOF was recorded
        let mut buf = [0u8; 16];
        let n = sock::read(dst_far.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert!(src.iostat.contains(IoFlags::EOF));
    }

    #[test]
    fn full_peer_arms_write_interest() {
        let (mut src, mut dst, src_far, _dst_far) = plumbing();

        // saturate the path: keep feeding until the splice can make no
        // progress because dst's socket buffer and src's ring are full
        sock::set_nonblocking(src_far.as_raw_fd(), true).unwrap();
        let chunk = [0x5au8; 4096];
        loop {
            match sock::write(src_far.as_raw_fd(), &chunk) {
                Ok(_) => splice(&mut src, &mut dst),
                Err(e) if sock::is_transient(&e) => break,
                Err(e) => panic!("unexpected write error: {}", e),
            }
        }
        splice(&mut src, &mut dst);

        assert!(!src.buf_empty());
        assert!(dst.interest.contains(PollEvents::OUT));
        assert!(src.iostat.contains(IoFlags::WRITE_DONE));
    }

    #[test]
    fn error_is_terminal() {
        let (mut src, mut dst, src_far, dst_far) = plumbing();

        // close the outgoing peer so the write fails with EPIPE
        drop(dst_far);
        sock::write(src_far.as_raw_fd(), b"doomed").unwrap();
        splice(&mut src, &mut dst);

        assert!(src.iostat.contains(IoFlags::ERROR));
    }

    #[test]
    fn teardown_releases_resources() {
        let (mut src, _dst, _src_far, _dst_far) = plumbing();

        let raw = src.raw_fd().unwrap();
        src.teardown();
        assert!(src.raw_fd().is_none());
        assert!(src.buf.is_none());

        // the fd is really closed
        assert_eq!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);
    }
}
