//! Per-connection state: the proxy descriptor, its two endpoints, and the
//! unified destruction path.

pub mod buffer;
pub mod endpoint;
pub mod queue;
pub mod syn_table;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::proxy::endpoint::{Endpoint, PollEvents};
use crate::proxy::syn_table::SynTable;
use crate::utility::unix_now;

/// Client address and port, the key a connection is tracked under. Also
/// used for the origin coordinates. Host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Life-cycle state of a proxied connection. The discriminants index the
/// status-name table inherited by the dump format, so the order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyStatus {
    Closed = 0,
    Open = 1,
    Connecting = 2,
    Pending = 3,
    Invalid = 4,
}

impl ProxyStatus {
    fn from_u8(v: u8) -> ProxyStatus {
        match v {
            0 => ProxyStatus::Closed,
            1 => ProxyStatus::Open,
            2 => ProxyStatus::Connecting,
            3 => ProxyStatus::Pending,
            _ => ProxyStatus::Invalid,
        }
    }

    /// State name as emitted in the status dump.
    pub fn label(self) -> &'static str {
        match self {
            ProxyStatus::Closed => "PST_CLOSED",
            ProxyStatus::Open => "PST_OPEN",
            ProxyStatus::Connecting => "PST_CONNECT",
            ProxyStatus::Pending => "PST_PENDING",
            ProxyStatus::Invalid => "PST_INVAL",
        }
    }
}

/// The two endpoints of a splice. `src` faces the client, `dst` faces the
/// origin server.
pub struct DataPlane {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl DataPlane {
    fn new() -> DataPlane {
        DataPlane {
            src: Endpoint::new(),
            dst: Endpoint::new(),
        }
    }

    pub fn endpoints_mut(&mut self) -> [&mut Endpoint; 2] {
        [&mut self.src, &mut self.dst]
    }

    /// One full worker pass: shuttle client-to-origin, then
    /// origin-to-client.
    pub fn splice_both(&mut self) {
        endpoint::splice(&mut self.src, &mut self.dst);
        endpoint::splice(&mut self.dst, &mut self.src);
    }
}

/// A full splice between a client and its original destination.
///
/// Shared ownership (`Arc`) replaces a manual reference count: the SYN
/// table entry, work-queue membership and any thread that pinned the
/// descriptor across a lock release each hold a strong reference. `status`
/// is the invariant driving life-cycle decisions; it never moves
/// backwards, and observing [`ProxyStatus::Closed`] is always sufficient
/// to bail out.
pub struct Proxy {
    key: ConnKey,
    origin: ConnKey,
    status: AtomicU8,
    syn_time: u64,
    syn_instant: Instant,
    last_rxtx: AtomicU64,
    enqueued: AtomicBool,
    plane: Mutex<DataPlane>,
}

impl Proxy {
    pub fn new(key: ConnKey, origin: ConnKey) -> Arc<Proxy> {
        Arc::new(Proxy {
            key,
            origin,
            status: AtomicU8::new(ProxyStatus::Invalid as u8),
            syn_time: unix_now(),
            syn_instant: Instant::now(),
            last_rxtx: AtomicU64::new(0),
            enqueued: AtomicBool::new(false),
            plane: Mutex::new(DataPlane::new()),
        })
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn origin(&self) -> ConnKey {
        self.origin
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ProxyStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Atomically move `from` to `to`. Transition races (listener
    /// activation vs. GC expiry) are arbitrated by whoever wins this CAS.
    pub fn try_transition(&self, from: ProxyStatus, to: ProxyStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_enqueued(&self, on: bool) -> bool {
        self.enqueued.swap(on, Ordering::AcqRel)
    }

    /// Unix time the initial SYN was recorded.
    pub fn syn_time(&self) -> u64 {
        self.syn_time
    }

    /// How long this descriptor has existed, for the pending-lifetime GC.
    pub fn age(&self) -> Duration {
        self.syn_instant.elapsed()
    }

    pub fn touch_rxtx(&self) {
        self.last_rxtx.store(unix_now(), Ordering::Relaxed);
    }

    /// Unix time of the last data-plane activity, if any.
    pub fn last_rxtx(&self) -> Option<u64> {
        match self.last_rxtx.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    pub fn plane(&self) -> MutexGuard<'_, DataPlane> {
        self.plane.lock().unwrap()
    }

    /// Prepare the origin-facing endpoint for an in-progress connect:
    /// attach the fd and arm write interest so connect completion is
    /// observable. Must be called with the PENDING→CONNECTING transition
    /// already won.
    pub fn attach_origin(plane: &mut DataPlane, fd: std::os::fd::OwnedFd) {
        plane.dst.attach(fd);
        plane.dst.interest.insert(PollEvents::OUT);
    }

    /// Unified teardown. Idempotent: the first caller to swap the status
    /// to CLOSED removes the table entry, closes both fds (after reverting
    /// them to blocking mode, a best-effort flush) and releases the
    /// buffers; later callers return immediately.
    pub fn destroy(self: &Arc<Self>, table: &SynTable) {
        let prev = self.status.swap(ProxyStatus::Closed as u8, Ordering::AcqRel);
        if prev == ProxyStatus::Closed as u8 {
            return;
        }
        log::debug!("{{{}}} destroying proxy", self.key);

        table.remove(self);

        let mut plane = self.plane();
        for endp in plane.endpoints_mut() {
            endp.teardown();
        }
    }

    /// GC entry point: close the descriptor only if it is still PENDING.
    /// Returns whether this call performed the teardown. A descriptor the
    /// listener managed to activate first is left alone.
    pub fn expire_pending(self: &Arc<Self>, table: &SynTable) -> bool {
        if !self.try_transition(ProxyStatus::Pending, ProxyStatus::Closed) {
            return false;
        }
        log::debug!("{{{}}} pending connection expired", self.key);

        table.remove(self);

        let mut plane = self.plane();
        for endp in plane.endpoints_mut() {
            endp.teardown();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::sock;
    use std::os::fd::AsRawFd;

    pub(crate) fn test_key(n: u8) -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(10, 0, 0, n),
            port: 40000 + n as u16,
        }
    }

    pub(crate) fn test_origin() -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(198, 51, 100, 1),
            port: 80,
        }
    }

    #[test]
    fn key_formats_as_addr_port() {
        assert_eq!(test_key(3).to_string(), "10.0.0.3:40003");
    }

    #[test]
    fn status_labels() {
        assert_eq!(ProxyStatus::Closed.label(), "PST_CLOSED");
        assert_eq!(ProxyStatus::Open.label(), "PST_OPEN");
        assert_eq!(ProxyStatus::Connecting.label(), "PST_CONNECT");
        assert_eq!(ProxyStatus::Pending.label(), "PST_PENDING");
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let proxy = Proxy::new(test_key(1), test_origin());
        assert_eq!(proxy.status(), ProxyStatus::Invalid);

        proxy.set_status(ProxyStatus::Pending);
        assert!(proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
        assert!(!proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
        assert!(proxy.try_transition(ProxyStatus::Connecting, ProxyStatus::Open));
        assert_eq!(proxy.status(), ProxyStatus::Open);
    }

    #[test]
    fn destroy_is_idempotent_and_releases_fds() {
        let table = SynTable::new(8);
        let proxy = Proxy::new(test_key(2), test_origin());
        proxy.set_status(ProxyStatus::Pending);
        table.insert(&proxy).unwrap();

        let (near, _far) = sock::socketpair_stream().unwrap();
        let raw = near.as_raw_fd();
        proxy.plane().src.attach(near);
        proxy.plane().src.arm_data_plane();

        proxy.destroy(&table);
        assert_eq!(proxy.status(), ProxyStatus::Closed);
        assert_eq!(table.len(), 0);
        assert!(proxy.plane().src.raw_fd().is_none());
        assert!(proxy.plane().src.buf.is_none());
        assert_eq!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);

        // second destroy is a no-op
        proxy.destroy(&table);
        assert_eq!(proxy.status(), ProxyStatus::Closed);
    }

    #[test]
    fn expiry_loses_to_activation() {
        let table = SynTable::new(8);
        let proxy = Proxy::new(test_key(4), test_origin());
        proxy.set_status(ProxyStatus::Pending);
        table.insert(&proxy).unwrap();

        // listener wins the race
        assert!(proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
        assert!(!proxy.expire_pending(&table));
        assert_eq!(proxy.status(), ProxyStatus::Connecting);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expiry_wins_when_still_pending() {
        let table = SynTable::new(8);
        let proxy = Proxy::new(test_key(5), test_origin());
        proxy.set_status(ProxyStatus::Pending);
        table.insert(&proxy).unwrap();

        assert!(proxy.expire_pending(&table));
        assert_eq!(proxy.status(), ProxyStatus::Closed);
        assert_eq!(table.len(), 0);

        // and the GC loser path: activation after expiry fails
        assert!(!proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
    }

    #[test]
    fn enqueued_flag_roundtrip() {
        let proxy = Proxy::new(test_key(6), test_origin());
        assert!(!proxy.enqueued());
        assert!(!proxy.set_enqueued(true));
        assert!(proxy.enqueued());
        assert!(proxy.set_enqueued(false));
        assert!(!proxy.enqueued());
    }

    #[test]
    fn rxtx_timestamp_starts_unset() {
        let proxy = Proxy::new(test_key(7), test_origin());
        assert_eq!(proxy.last_rxtx(), None);
        proxy.touch_rxtx();
        assert!(proxy.last_rxtx().is_some());
    }
}
