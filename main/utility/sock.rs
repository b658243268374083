//! Thin typed wrappers around the socket-layer syscalls.
//!
//! Everything the data plane needs goes through raw [`libc`] calls checked
//! with [`nix::errno::Errno::result`]: the TPROXY-era options
//! (`IP_TRANSPARENT`, `SO_MARK`, `TCP_CONGESTION`, `TCP_FASTOPEN`,
//! `TCP_MAXSEG`) have no stable higher-level surface, and keeping the rest
//! of the calls in the same style keeps errno handling in one place.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

fn check<T: nix::errno::ErrnoSentinel + PartialEq<T>>(ret: T) -> io::Result<T> {
    Errno::result(ret).map_err(errno_to_io)
}

fn errno_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

unsafe fn setsockopt_raw<T>(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    val: &T,
) -> io::Result<()> {
    check(unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            std::ptr::from_ref(val).cast::<libc::c_void>(),
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    })
    .map(drop)
}

fn sockaddr_in(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr.s_addr = u32::from(addr).to_be();
    sa
}

fn from_sockaddr_in(sa: &libc::sockaddr_in) -> (Ipv4Addr, u16) {
    (
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

/// Create an IPv4 stream socket, optionally non-blocking from birth.
pub fn new_tcp_socket(nonblocking: bool) -> io::Result<OwnedFd> {
    let mut ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    if nonblocking {
        ty |= libc::SOCK_NONBLOCK;
    }
    let fd = check(unsafe { libc::socket(libc::AF_INET, ty, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn bind(fd: &OwnedFd, addr: Ipv4Addr, port: u16) -> io::Result<()> {
    let sa = sockaddr_in(addr, port);
    check(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::from_ref(&sa).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .map(drop)
}

pub fn listen(fd: &OwnedFd, backlog: libc::c_int) -> io::Result<()> {
    check(unsafe { libc::listen(fd.as_raw_fd(), backlog) }).map(drop)
}

/// Accept one connection; returns the connected fd and the peer address.
pub fn accept(fd: &OwnedFd) -> io::Result<(OwnedFd, (Ipv4Addr, u16))> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let conn = check(unsafe {
        libc::accept(
            fd.as_raw_fd(),
            std::ptr::from_mut(&mut sa).cast::<libc::sockaddr>(),
            &mut len,
        )
    })?;
    Ok((unsafe { OwnedFd::from_raw_fd(conn) }, from_sockaddr_in(&sa)))
}

/// Initiate a connection; the caller classifies in-progress indications.
pub fn connect(fd: &OwnedFd, addr: Ipv4Addr, port: u16) -> io::Result<()> {
    let sa = sockaddr_in(addr, port);
    check(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            std::ptr::from_ref(&sa).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// Zero-length `sendto` with `MSG_FASTOPEN`: opens the connection with the
/// SYN carrying no payload, the Fast Open variant of [`connect`].
pub fn connect_fastopen(fd: &OwnedFd, addr: Ipv4Addr, port: u16) -> io::Result<()> {
    let sa = sockaddr_in(addr, port);
    check(unsafe {
        libc::sendto(
            fd.as_raw_fd(),
            std::ptr::null(),
            0,
            libc::MSG_FASTOPEN,
            std::ptr::from_ref(&sa).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// Local name of the socket. On a connection accepted through a TPROXY
/// redirect this is the *original* destination, not a local address.
pub fn getsockname(fd: &OwnedFd) -> io::Result<(Ipv4Addr, u16)> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    check(unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            std::ptr::from_mut(&mut sa).cast::<libc::sockaddr>(),
            &mut len,
        )
    })?;
    Ok(from_sockaddr_in(&sa))
}

pub fn set_reuse_addr(fd: &OwnedFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    unsafe { setsockopt_raw(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, &on) }
}

/// Allow binding to and accepting traffic for non-local addresses.
/// Requires `CAP_NET_ADMIN`.
pub fn set_ip_transparent(fd: &OwnedFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    unsafe { setsockopt_raw(fd.as_raw_fd(), libc::SOL_IP, libc::IP_TRANSPARENT, &on) }
}

pub fn set_mark(fd: &OwnedFd, mark: u32) -> io::Result<()> {
    unsafe { setsockopt_raw(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_MARK, &mark) }
}

pub fn set_congestion(fd: &OwnedFd, algo: &str) -> io::Result<()> {
    check(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            algo.as_ptr().cast::<libc::c_void>(),
            algo.len() as libc::socklen_t,
        )
    })
    .map(drop)
}

pub fn set_fastopen_queue(fd: &OwnedFd, qlen: libc::c_int) -> io::Result<()> {
    unsafe { setsockopt_raw(fd.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_FASTOPEN, &qlen) }
}

pub fn set_max_segment(fd: &OwnedFd, mss: u32) -> io::Result<()> {
    let mss = mss as libc::c_int;
    unsafe { setsockopt_raw(fd.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_MAXSEG, &mss) }
}

pub fn max_segment(fd: RawFd) -> io::Result<u32> {
    let mut mss: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    check(unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            std::ptr::from_mut(&mut mss).cast::<libc::c_void>(),
            &mut len,
        )
    })?;
    Ok(mss as u32)
}

/// Pending asynchronous error on the socket, consumed by reading it.
/// Zero means the in-progress connect has completed successfully.
pub fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    check(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::from_mut(&mut err).cast::<libc::c_void>(),
            &mut len,
        )
    })?;
    Ok(err)
}

/// Short send/receive timeouts for the data plane, so a worker stuck on a
/// socket that regressed to blocking mode cannot stall its whole batch.
pub fn set_io_timeouts(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    unsafe { setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)? };
    unsafe { setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &tv) }
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = check(unsafe {
        libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
    })?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = check(unsafe {
        libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len())
    })?;
    Ok(n as usize)
}

/// Wait for readiness on `fds`. A negative timeout blocks indefinitely.
/// `EINTR` is surfaced to the caller, which restarts its cycle.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize> {
    let n = check(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) })?;
    Ok(n as usize)
}

pub fn eventfd() -> io::Result<OwnedFd> {
    let fd = check(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Whether `err` is one of the non-blocking I/O indications (would-block,
/// in-progress, already-in-progress) rather than a real failure.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINPROGRESS) | Some(libc::EALREADY)
    )
}

#[cfg(test)]
pub fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    check(unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
