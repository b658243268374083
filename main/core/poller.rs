//! The readiness multiplexer.
//!
//! Each cycle rebuilds a flat pollfd array from the SYN table (two
//! entries per descriptor, the wake eventfd in slot zero), polls, then
//! classifies: descriptors still connecting are promoted to OPEN when the
//! outbound fd turns writable with no pending socket error, and ready
//! OPEN descriptors are batched through the active/ready queue barrier to
//! the workers. Reaping clears the transient I/O flags or destroys the
//! descriptor when an endpoint reports a terminal condition.
//!
//! Only this thread closes data-plane fds (the listener destroys only
//! descriptors it has not yet published, the GC only fd-less PENDING
//! ones), so an fd captured in the poll array cannot be closed or reused
//! before `poll()` returns.

use std::io;
use std::sync::Arc;

use anyhow::Context;

use crate::core::configuration::DATA_IO_TIMEOUT;
use crate::core::PepContext;
use crate::proxy::endpoint::{IoFlags, PollEvents};
use crate::proxy::{Proxy, ProxyStatus};
use crate::utility::sock;

/// Index of the origin-facing endpoint in a descriptor's poll entries
/// (the client-facing endpoint is entry 0).
const DST: usize = 1;

struct PollSlot {
    proxy: Arc<Proxy>,
    endpoint: usize,
}

pub fn poller_loop(ctx: Arc<PepContext>) -> anyhow::Result<()> {
    // one-time sizing: two endpoints per descriptor plus the wake fd
    let max_entries = ctx.config.max_conns * 2 + 1;
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(max_entries);
    let mut slots: Vec<PollSlot> = Vec::with_capacity(max_entries);

    log::debug!("entering poller loop");
    loop {
        pollfds.clear();
        slots.clear();

        pollfds.push(libc::pollfd {
            fd: ctx.waker.as_raw_fd(),
            events: PollEvents::IN.bits(),
            revents: 0,
        });

        ctx.table.for_each(|proxy| {
            // status may be written by other threads between here and
            // classification; a stale read is safe because CLOSED is
            // terminal and PENDING descriptors have no fds yet
            let status = proxy.status();
            if status == ProxyStatus::Pending || status == ProxyStatus::Closed {
                return;
            }

            let plane = proxy.plane();
            for (endpoint, endp) in [&plane.src, &plane.dst].into_iter().enumerate() {
                let Some(fd) = endp.raw_fd() else { continue };
                pollfds.push(libc::pollfd {
                    fd,
                    events: endp.interest.bits(),
                    revents: 0,
                });
                slots.push(PollSlot {
                    proxy: Arc::clone(proxy),
                    endpoint,
                });
            }
        });

        // with no connections this blocks on the wake fd alone, standing
        // in for the classic signal wait
        match sock::poll(&mut pollfds, -1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("poll() failed"),
        }

        if pollfds[0].revents != 0 {
            // the listener published a new descriptor; pick it up on the
            // rebuild at the top of the loop
            ctx.waker.drain();
        }

        let mut batch: Vec<Arc<Proxy>> = Vec::new();
        for (pfd, slot) in pollfds[1..].iter().zip(slots.iter()) {
            let revents = PollEvents::from_bits_truncate(pfd.revents);
            if revents.is_empty() {
                continue;
            }

            let proxy = &slot.proxy;
            if proxy.enqueued() {
                // the other endpoint already queued this descriptor
                continue;
            }

            match proxy.status() {
                ProxyStatus::Connecting => {
                    if revents.intersects(PollEvents::FATAL) {
                        log::debug!("{{{}}} connection lost during connect", proxy.key());
                        proxy.destroy(&ctx.table);
                        continue;
                    }
                    if slot.endpoint != DST || !revents.contains(PollEvents::OUT) {
                        continue;
                    }
                    match connect_outcome(proxy) {
                        Ok(0) => {
                            if let Err(e) = promote(proxy) {
                                log::warn!(
                                    "{{{}}} failed to set up data plane: {}",
                                    proxy.key(),
                                    e
                                );
                                proxy.destroy(&ctx.table);
                                continue;
                            }
                            // fall through to OPEN handling so the
                            // readiness that completed the connect is not
                            // lost
                        }
                        Ok(errno) => {
                            log::debug!(
                                "{{{}}} connect to {} failed: {}",
                                proxy.key(),
                                proxy.origin(),
                                io::Error::from_raw_os_error(errno)
                            );
                            proxy.destroy(&ctx.table);
                            continue;
                        }
                        Err(e) => {
                            log::warn!("{{{}}} failed to read SO_ERROR: {}", proxy.key(), e);
                            proxy.destroy(&ctx.table);
                            continue;
                        }
                    }
                }
                ProxyStatus::Open => {
                    if revents.intersects(PollEvents::FATAL) {
                        proxy.destroy(&ctx.table);
                        continue;
                    }
                }
                // PENDING never makes it into the array; CLOSED means a
                // destroyer got here first
                _ => continue,
            }

            if revents.intersects(PollEvents::IN | PollEvents::OUT)
                && !proxy.set_enqueued(true)
            {
                batch.push(Arc::clone(proxy));
            }
        }

        if batch.is_empty() {
            continue;
        }

        let done = ctx.queues.dispatch_and_wait(batch);
        reap(&ctx, done);
    }
}

fn connect_outcome(proxy: &Arc<Proxy>) -> io::Result<i32> {
    let plane = proxy.plane();
    match plane.dst.raw_fd() {
        Some(fd) => sock::so_error(fd),
        None => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
}

/// CONNECTING → OPEN: allocate both buffers (exactly once; this is the
/// only call site and the status guards re-entry), arm read interest,
/// and put both fds into non-blocking mode with short I/O timeouts.
fn promote(proxy: &Arc<Proxy>) -> io::Result<()> {
    let mut plane = proxy.plane();
    for endp in plane.endpoints_mut() {
        endp.arm_data_plane();
        if let Some(fd) = endp.raw_fd() {
            sock::set_nonblocking(fd, true)?;
            sock::set_io_timeouts(fd, DATA_IO_TIMEOUT)?;
        }
    }
    // connect completion consumed; splice re-arms write interest on demand
    plane.dst.interest.remove(PollEvents::OUT);
    drop(plane);

    proxy.set_status(ProxyStatus::Open);
    log::debug!("{{{}}} connection to {} established", proxy.key(), proxy.origin());
    Ok(())
}

/// Post-barrier bookkeeping: destroy descriptors whose endpoints hit a
/// terminal condition (error, or EOF with the buffer drained), clear the
/// transient flags on the rest.
fn reap(ctx: &PepContext, done: Vec<Arc<Proxy>>) {
    for proxy in done {
        proxy.set_enqueued(false);

        let mut dead = false;
        {
            let mut plane = proxy.plane();
            for endp in plane.endpoints_mut() {
                let iostat = endp.iostat;
                if iostat.contains(IoFlags::ERROR)
                    || (iostat.contains(IoFlags::EOF) && endp.buf_empty())
                {
                    dead = true;
                    break;
                }
                endp.clear_transients();
            }
        }
        if dead {
            proxy.destroy(&ctx.table);
        }
    }
}
