//! The timer thread: garbage collection of never-activated descriptors
//! and the periodic status dump, both driven off one fixed-cadence loop.

use std::time::Instant;

use crate::core::configuration::{STATUS_DUMP_INTERVAL, TIMER_TICK};
use crate::core::status::StatusDumper;
use crate::core::PepContext;
use crate::proxy::ProxyStatus;

pub fn timer_loop(ctx: &PepContext, mut dumper: Option<StatusDumper>) -> ! {
    let mut last_gc = Instant::now();
    let mut last_dump = Instant::now();

    loop {
        std::thread::sleep(TIMER_TICK);

        if let Some(dumper) = dumper.as_mut() {
            if last_dump.elapsed() >= STATUS_DUMP_INTERVAL {
                if let Err(e) = dumper.dump(&ctx.table) {
                    log::warn!("status dump failed: {}", e);
                }
                last_dump = Instant::now();
            }
        }

        if last_gc.elapsed() >= ctx.config.gc_interval {
            collect_garbage(ctx);
            last_gc = Instant::now();
        }
    }
}

/// Reap descriptors that recorded a SYN but were never activated. A client
/// that died right after its SYN leaves no other trace, so age is the only
/// signal. Activated descriptors are never collected here; the
/// PENDING→CLOSED arbitration in `expire_pending` keeps a concurrent
/// activation safe.
pub fn collect_garbage(ctx: &PepContext) {
    log::debug!("garbage collector activated");

    let lifetime = ctx.config.pending_lifetime;
    for proxy in ctx.table.snapshot() {
        if proxy.status() != ProxyStatus::Pending {
            continue;
        }
        if proxy.age() >= lifetime {
            proxy.expire_pending(&ctx.table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::Config;
    use crate::proxy::{ConnKey, Proxy};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn ctx_with_lifetime(lifetime: Duration) -> std::sync::Arc<PepContext> {
        let mut config = Config::for_tests();
        config.pending_lifetime = lifetime;
        PepContext::new(config).unwrap()
    }

    fn pending(n: u8) -> std::sync::Arc<Proxy> {
        let proxy = Proxy::new(
            ConnKey {
                addr: Ipv4Addr::new(10, 6, 0, n),
                port: 41000 + n as u16,
            },
            ConnKey {
                addr: Ipv4Addr::new(203, 0, 113, 4),
                port: 22,
            },
        );
        proxy.set_status(ProxyStatus::Pending);
        proxy
    }

    #[test]
    fn expired_pending_descriptors_are_collected() {
        let ctx = ctx_with_lifetime(Duration::ZERO);
        let proxy = pending(1);
        ctx.table.insert(&proxy).unwrap();

        collect_garbage(&ctx);
        assert!(ctx.table.is_empty());
        assert_eq!(proxy.status(), ProxyStatus::Closed);
    }

    #[test]
    fn young_pending_descriptors_survive() {
        let ctx = ctx_with_lifetime(Duration::from_secs(3600));
        let proxy = pending(2);
        ctx.table.insert(&proxy).unwrap();

        collect_garbage(&ctx);
        assert_eq!(ctx.table.len(), 1);
        assert_eq!(proxy.status(), ProxyStatus::Pending);
    }

    #[test]
    fn activated_descriptors_are_never_collected() {
        let ctx = ctx_with_lifetime(Duration::ZERO);
        for (n, status) in [(3, ProxyStatus::Connecting), (4, ProxyStatus::Open)] {
            let proxy = pending(n);
            ctx.table.insert(&proxy).unwrap();
            proxy.set_status(status);
        }

        collect_garbage(&ctx);
        assert_eq!(ctx.table.len(), 2);
    }
}
