//! Accepts redirected connections and activates their descriptors.
//!
//! The host's packet classifier steers foreign TCP traffic to this
//! socket; because the listener binds transparently, `getsockname` on an
//! accepted connection yields the *original* destination, which is where
//! the outbound leg then connects.

use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use anyhow::Context;

use crate::core::configuration::{Config, FASTOPEN_QUEUE_HINT, LISTEN_BACKLOG};
use crate::core::PepContext;
use crate::proxy::{ConnKey, Proxy, ProxyStatus};
use crate::utility::sock;

pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Build and bind the listening socket. Failures here are fatal:
    /// without the listener the gateway serves nothing.
    pub fn bind(config: &Config) -> anyhow::Result<Listener> {
        let fd = sock::new_tcp_socket(false).context("Creating the listener socket")?;

        sock::set_reuse_addr(&fd).context("Setting SO_REUSEADDR on the listener")?;
        sock::set_ip_transparent(&fd)
            .context("Setting IP_TRANSPARENT on the listener (requires CAP_NET_ADMIN)")?;

        if let Some(mark) = config.ingress_mark {
            sock::set_mark(&fd, mark)
                .with_context(|| format!("Setting ingress mark {}", mark))?;
        }
        if let Some(algo) = &config.ingress_cc {
            sock::set_congestion(&fd, algo)
                .with_context(|| format!("Setting ingress congestion algorithm {:?}", algo))?;
        }
        if config.fastopen {
            sock::set_fastopen_queue(&fd, FASTOPEN_QUEUE_HINT)
                .context("Enabling TCP_FASTOPEN on the listener")?;
        }
        if let Some(mss) = config.ingress_mss {
            sock::set_max_segment(&fd, mss)
                .with_context(|| format!("Clamping ingress MSS to {}", mss))?;
        }

        sock::bind(&fd, Ipv4Addr::UNSPECIFIED, config.port)
            .with_context(|| format!("Binding listener to port {}", config.port))?;
        sock::listen(&fd, LISTEN_BACKLOG).context("Listening")?;

        log::debug!("listener bound on port {}", config.port);
        Ok(Listener { fd })
    }

    /// Accept connections forever. Per-connection failures are logged and
    /// the gateway keeps serving.
    pub fn accept_loop(self, ctx: Arc<PepContext>) -> ! {
        log::debug!("entering listener accept loop");
        loop {
            let (conn, (peer_addr, peer_port)) = match sock::accept(&self.fd) {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("accept() failed: {}", e);
                    continue;
                }
            };

            let key = ConnKey {
                addr: peer_addr,
                port: peer_port,
            };
            self.activate(&ctx, conn, key);
        }
    }

    /// Drive one accepted connection from first sighting to CONNECTING:
    /// record the descriptor, open the outbound leg and hand the pair to
    /// the poller. Dropping `conn`/the descriptor on any failure path
    /// closes whatever was opened.
    fn activate(&self, ctx: &PepContext, conn: OwnedFd, key: ConnKey) {
        let origin = match sock::getsockname(&conn) {
            Ok((addr, port)) => ConnKey { addr, port },
            Err(e) => {
                log::warn!("{{{}}} failed to recover original destination: {}", key, e);
                return;
            }
        };
        log::debug!("{{{}}} new connection, original destination {}", key, origin);

        let proxy = Proxy::new(key, origin);
        {
            let mut plane = proxy.plane();
            plane.src.attach(conn);
        }
        proxy.set_status(ProxyStatus::Pending);

        if let Err(e) = ctx.table.insert(&proxy) {
            // A duplicate SYN while the first is still live: drop the new
            // connection, the existing entry remains authoritative.
            log::debug!("{{{}}} not tracking connection: {}", key, e);
            return;
        }
        log::debug!("{{{}}} registered new SYN", key);

        match self.connect_origin(ctx, origin) {
            Ok(out) => {
                let mut plane = proxy.plane();
                if !proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting) {
                    // The GC expired the entry while we were connecting;
                    // it already tore down the inbound side.
                    log::debug!("{{{}}} activation aborted, descriptor reaped", key);
                    return;
                }
                Proxy::attach_origin(&mut plane, out);
                drop(plane);

                log::debug!("{{{}}} connecting to {}", key, origin);
                ctx.waker.wake();
            }
            Err(e) => {
                log::warn!("{{{}}} failed to open outbound leg to {}: {}", key, origin, e);
                proxy.destroy(&ctx.table);
            }
        }
    }

    /// Create the origin-facing socket and initiate the connection.
    /// In-progress indications from the non-blocking connect are success.
    fn connect_origin(&self, ctx: &PepContext, origin: ConnKey) -> std::io::Result<OwnedFd> {
        let config = &ctx.config;
        let fd = sock::new_tcp_socket(true)?;

        if let Some(mark) = config.egress_mark {
            sock::set_mark(&fd, mark)?;
        }
        if let Some(algo) = &config.egress_cc {
            sock::set_congestion(&fd, algo)?;
        }
        sock::set_ip_transparent(&fd)?;

        let result = if config.fastopen {
            sock::connect_fastopen(&fd, origin.addr, origin.port)
        } else {
            sock::connect(&fd, origin.addr, origin.port)
        };
        match result {
            Ok(()) => {}
            Err(e) if sock::is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::endpoint::PollEvents;
    use std::os::fd::AsRawFd;

    fn key(n: u8) -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(10, 3, 0, n),
            port: 50000 + n as u16,
        }
    }

    fn origin() -> ConnKey {
        ConnKey {
            addr: Ipv4Addr::new(203, 0, 113, 2),
            port: 8080,
        }
    }

    /// The listener-side half of activation, without a real accept: a
    /// descriptor is inserted PENDING with the inbound fd attached, then
    /// promoted with the outbound fd and write interest armed.
    #[test]
    fn activation_attaches_and_promotes() {
        let table = crate::proxy::syn_table::SynTable::new(8);
        let (conn, _client) = sock::socketpair_stream().unwrap();
        let (out, _origin_side) = sock::socketpair_stream().unwrap();

        let proxy = Proxy::new(key(1), origin());
        proxy.plane().src.attach(conn);
        proxy.set_status(ProxyStatus::Pending);
        table.insert(&proxy).unwrap();

        let mut plane = proxy.plane();
        assert!(proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
        Proxy::attach_origin(&mut plane, out);

        assert!(plane.dst.interest.contains(PollEvents::OUT));
        assert!(!plane.src.interest.contains(PollEvents::IN));
        assert!(plane.src.raw_fd().is_some());
        assert!(plane.dst.raw_fd().is_some());
        drop(plane);
        assert_eq!(proxy.status(), ProxyStatus::Connecting);
    }

    /// The GC wins the race: activation aborts, and dropping the outbound
    /// fd the listener created closes it.
    #[test]
    fn activation_aborts_when_reaped() {
        let table = crate::proxy::syn_table::SynTable::new(8);
        let (conn, _client) = sock::socketpair_stream().unwrap();
        let (out, _origin_side) = sock::socketpair_stream().unwrap();
        let out_raw = out.as_raw_fd();

        let proxy = Proxy::new(key(2), origin());
        proxy.plane().src.attach(conn);
        proxy.set_status(ProxyStatus::Pending);
        table.insert(&proxy).unwrap();

        // GC expires the entry before the listener's transition
        assert!(proxy.expire_pending(&table));

        let plane = proxy.plane();
        assert!(!proxy.try_transition(ProxyStatus::Pending, ProxyStatus::Connecting));
        drop(plane);
        drop(out); // the aborting listener's cleanup

        assert_eq!(unsafe { libc::fcntl(out_raw, libc::F_GETFD) }, -1);
        assert_eq!(proxy.status(), ProxyStatus::Closed);
        assert_eq!(table.len(), 0);
    }
}
