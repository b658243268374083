//! Periodic JSON status dump.
//!
//! One JSON object per interval describing every tracked connection,
//! written to the destination selected with `-l`. Per-connection link
//! telemetry (`TCP_MAXSEG`, `TCP_INFO`) is best-effort: fields are simply
//! omitted when the socket cannot answer, e.g. for a not-yet-connected
//! outbound leg or a non-TCP fd in tests.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

use serde::Serialize;

use crate::core::configuration::DumpTarget;
use crate::proxy::syn_table::SynTable;
use crate::proxy::Proxy;
use crate::utility::{sock, unix_now};

pub struct StatusDumper {
    out: Box<dyn Write + Send>,
}

#[derive(Serialize)]
struct Report {
    time: u64,
    proxies: Vec<ProxyEntry>,
}

#[derive(Serialize)]
struct ProxyEntry {
    src: String,
    dst: String,
    status: &'static str,
    sync_recv: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_rxtx: Option<u64>,
    #[serde(rename = "mss egress", skip_serializing_if = "Option::is_none")]
    mss_egress: Option<u32>,
    #[serde(rename = "mss ingress", skip_serializing_if = "Option::is_none")]
    mss_ingress: Option<u32>,
    #[serde(flatten)]
    link: Option<LinkStats>,
}

/// Outbound-leg telemetry from `TCP_INFO`. Times in microseconds, rates
/// in bytes per second.
#[derive(Serialize)]
struct LinkStats {
    rtt: u32,
    rtt_var: u32,
    retransmits: u32,
    cwnd: u32,
    pacing_rate: u64,
    max_pacing_rate: u64,
    delivery_rate: u64,
}

impl StatusDumper {
    pub fn open(target: &DumpTarget) -> io::Result<StatusDumper> {
        let out: Box<dyn Write + Send> = match target {
            DumpTarget::Stdout => Box::new(io::stdout()),
            DumpTarget::Stderr => Box::new(io::stderr()),
            DumpTarget::File(path) => Box::new(File::create(path)?),
        };
        Ok(StatusDumper { out })
    }

    /// Serialize the current table, one object per line.
    pub fn dump(&mut self, table: &SynTable) -> io::Result<()> {
        log::debug!("status dump activated");

        let mut proxies = Vec::with_capacity(table.len());
        table.for_each(|proxy| proxies.push(entry_for(proxy)));

        let report = Report {
            time: unix_now(),
            proxies,
        };
        serde_json::to_writer(&mut self.out, &report)?;
        writeln!(self.out)?;
        self.out.flush()
    }
}

fn entry_for(proxy: &Arc<Proxy>) -> ProxyEntry {
    let plane = proxy.plane();
    let src_fd = plane.src.raw_fd();
    let dst_fd = plane.dst.raw_fd();
    drop(plane);

    ProxyEntry {
        src: proxy.key().to_string(),
        dst: proxy.origin().to_string(),
        status: proxy.status().label(),
        sync_recv: proxy.syn_time(),
        last_rxtx: proxy.last_rxtx(),
        mss_egress: dst_fd.and_then(|fd| sock::max_segment(fd).ok()),
        mss_ingress: src_fd.and_then(|fd| sock::max_segment(fd).ok()),
        link: dst_fd.and_then(link_stats),
    }
}

/// Kernel `tcp_info`, declared through the fields the dump consumes (the
/// layout follows the uapi header; the kernel copies however much of it
/// the running version knows about, the rest stays zero).
#[repr(C)]
#[derive(Default)]
struct TcpInfo {
    state: u8,
    ca_state: u8,
    retransmits: u8,
    probes: u8,
    backoff: u8,
    options: u8,
    wscale: u8,
    app_limited: u8,
    rto: u32,
    ato: u32,
    snd_mss: u32,
    rcv_mss: u32,
    unacked: u32,
    sacked: u32,
    lost: u32,
    retrans: u32,
    fackets: u32,
    last_data_sent: u32,
    last_ack_sent: u32,
    last_data_recv: u32,
    last_ack_recv: u32,
    pmtu: u32,
    rcv_ssthresh: u32,
    rtt: u32,
    rttvar: u32,
    snd_ssthresh: u32,
    snd_cwnd: u32,
    advmss: u32,
    reordering: u32,
    rcv_rtt: u32,
    rcv_space: u32,
    total_retrans: u32,
    pacing_rate: u64,
    max_pacing_rate: u64,
    bytes_acked: u64,
    bytes_received: u64,
    segs_out: u32,
    segs_in: u32,
    notsent_bytes: u32,
    min_rtt: u32,
    data_segs_in: u32,
    data_segs_out: u32,
    delivery_rate: u64,
}

fn link_stats(fd: RawFd) -> Option<LinkStats> {
    let mut info = TcpInfo::default();
    let mut len = std::mem::size_of::<TcpInfo>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            std::ptr::from_mut(&mut info).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }

    Some(LinkStats {
        rtt: info.rtt,
        rtt_var: info.rttvar,
        retransmits: info.total_retrans,
        cwnd: info.snd_cwnd,
        pacing_rate: info.pacing_rate,
        max_pacing_rate: info.max_pacing_rate,
        delivery_rate: info.delivery_rate,
    })
}
