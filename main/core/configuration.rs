//! CLI parsing and the resolved runtime configuration.
//!
//! This code only checks that values are well-formed (bounds, formats);
//! whether the host actually grants `CAP_NET_ADMIN` or the congestion
//! algorithms exist is discovered when the sockets are configured.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use static_assertions::const_assert;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_PENDING_LIFETIME_SECS: u64 = 300;

/// Bounds on the `-c` connection limit.
pub const PEP_MIN_CONNS: usize = 128;
pub const PEP_MAX_CONNS: usize = 2048;
pub const DEFAULT_MAX_CONNS: usize = (PEP_MIN_CONNS + PEP_MAX_CONNS) / 2;

const_assert!(PEP_MIN_CONNS < PEP_MAX_CONNS);

/// Size of the fixed worker-thread pool.
pub const POOL_WORKERS: usize = 5;

pub const LISTEN_BACKLOG: libc::c_int = 100;

/// Queue-length hint passed with `TCP_FASTOPEN` on the listener.
pub const FASTOPEN_QUEUE_HINT: libc::c_int = 5;

/// Send/receive timeouts applied to data-plane sockets once open.
pub const DATA_IO_TIMEOUT: Duration = Duration::from_millis(10);

pub const STATUS_DUMP_INTERVAL: Duration = Duration::from_secs(5);
pub const TIMER_TICK: Duration = Duration::from_secs(2);

// Expected maximum header sizes from the IP/TCP standards, used for the
// MSS clamp.
pub const IP_HEADER_SIZE: u32 = 24;
pub const TCP_HEADER_SIZE: u32 = 26;

// https://elixir.bootlin.com/linux/v6.1.70/source/include/net/tcp.h#L65
pub const MAX_TCP_WINDOW: u32 = 32767;

const ABOUT_TEXT: &str = "\
    Transparent TCP Performance Enhancing Proxy for high-latency links.\n\n\
    Terminates redirected TCP connections locally, opens a second leg to \
    the original destination and splices the byte streams, so each half \
    of the path can run its own congestion control and MSS.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "pepd", about = ABOUT_TEXT, version)]
pub struct CliOptions {
    /// Detach and run in the background
    #[clap(long, short = 'd')]
    pub daemon: bool,

    /// Enable verbose (debug) logging
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Use TCP Fast Open on the listener and toward origins
    #[clap(long, short = 'f')]
    pub fastopen: bool,

    /// Port the packet classifier redirects connections to
    #[clap(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// MTU of the ingress device; clamps the ingress MSS (must exceed 80)
    #[clap(long = "mtu", short = 'u', value_name = "mtu")]
    pub ingress_mtu: Option<u32>,

    /// Firewall mark set on sockets toward the origin
    #[clap(long = "egress-mark", short = 'm', value_name = "uint")]
    pub egress_mark: Option<u32>,

    /// Firewall mark set on the listening socket
    #[clap(long = "ingress-mark", short = 'n', value_name = "uint")]
    pub ingress_mark: Option<u32>,

    /// TCP congestion control algorithm toward the origin
    #[clap(long = "egress-cc", short = 'a', value_name = "name")]
    pub egress_cc: Option<String>,

    /// TCP congestion control algorithm toward the client
    #[clap(long = "ingress-cc", short = 'b', value_name = "name")]
    pub ingress_cc: Option<String>,

    /// Periodic status dump destination: a path, "stdout" or "stderr"
    #[clap(long = "logfile", short = 'l', value_name = "path")]
    pub logfile: Option<String>,

    /// Seconds a pending connection may wait for activation before the
    /// garbage collector reaps it
    #[clap(long = "plifetime", short = 't', value_name = "sec",
           default_value_t = DEFAULT_PENDING_LIFETIME_SECS)]
    pub pending_lifetime: u64,

    /// Garbage collector interval in seconds
    #[clap(long = "gc-interval", short = 'g', value_name = "sec",
           default_value_t = DEFAULT_GC_INTERVAL_SECS)]
    pub gc_interval: u64,

    /// Maximum number of proxied connections
    #[clap(long = "conns", short = 'c', default_value_t = DEFAULT_MAX_CONNS)]
    pub max_conns: usize,
}

/// Where the periodic status dump goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTarget {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl DumpTarget {
    fn parse(s: &str) -> DumpTarget {
        match s {
            "stdout" => DumpTarget::Stdout,
            "stderr" => DumpTarget::Stderr,
            path => DumpTarget::File(PathBuf::from(path)),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub daemonize: bool,
    pub verbose: bool,
    pub fastopen: bool,
    pub port: u16,
    /// Ingress MSS derived from the `-u` MTU, already clamped.
    pub ingress_mss: Option<u32>,
    pub egress_mark: Option<u32>,
    pub ingress_mark: Option<u32>,
    pub egress_cc: Option<String>,
    pub ingress_cc: Option<String>,
    pub dump_target: Option<DumpTarget>,
    pub pending_lifetime: Duration,
    pub gc_interval: Duration,
    pub max_conns: usize,
}

impl Config {
    pub fn new(options: CliOptions) -> anyhow::Result<Config> {
        if !(PEP_MIN_CONNS..=PEP_MAX_CONNS).contains(&options.max_conns) {
            anyhow::bail!(
                "connection limit {} outside supported range [{}, {}]",
                options.max_conns,
                PEP_MIN_CONNS,
                PEP_MAX_CONNS
            );
        }

        let ingress_mss = match options.ingress_mtu {
            Some(mtu) if mtu <= 80 => {
                anyhow::bail!("ingress mtu must exceed 80, got {}", mtu)
            }
            Some(mtu) => Some(mss_clamp(mtu)),
            None => None,
        };

        Ok(Config {
            daemonize: options.daemon,
            verbose: options.verbose,
            fastopen: options.fastopen,
            port: options.port,
            ingress_mss,
            egress_mark: options.egress_mark.filter(|&m| m > 0),
            ingress_mark: options.ingress_mark.filter(|&m| m > 0),
            egress_cc: options.egress_cc.filter(|a| !a.is_empty()),
            ingress_cc: options.ingress_cc.filter(|a| !a.is_empty()),
            dump_target: options.logfile.as_deref().map(DumpTarget::parse),
            pending_lifetime: Duration::from_secs(options.pending_lifetime),
            gc_interval: Duration::from_secs(options.gc_interval),
            max_conns: options.max_conns,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Config {
        Config {
            daemonize: false,
            verbose: true,
            fastopen: false,
            port: DEFAULT_PORT,
            ingress_mss: None,
            egress_mark: None,
            ingress_mark: None,
            egress_cc: None,
            ingress_cc: None,
            dump_target: None,
            pending_lifetime: Duration::from_secs(DEFAULT_PENDING_LIFETIME_SECS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            max_conns: PEP_MIN_CONNS,
        }
    }
}

/// The segment size that keeps a full segment inside `mtu`, capped at the
/// largest window TCP will advertise anyway.
pub fn mss_clamp(mtu: u32) -> u32 {
    (mtu - IP_HEADER_SIZE - TCP_HEADER_SIZE).min(MAX_TCP_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliOptions {
        CliOptions::try_parse_from(std::iter::once("pepd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::new(parse(&[])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_conns, DEFAULT_MAX_CONNS);
        assert_eq!(config.gc_interval, Duration::from_secs(900));
        assert_eq!(config.pending_lifetime, Duration::from_secs(300));
        assert!(!config.fastopen);
        assert!(config.dump_target.is_none());
        assert!(config.ingress_mss.is_none());
    }

    #[test]
    fn short_flags() {
        let config = Config::new(parse(&[
            "-d", "-v", "-f", "-p", "5201", "-m", "7", "-n", "8", "-a", "cubic", "-b", "hybla",
            "-l", "stderr", "-t", "10", "-g", "5", "-c", "256",
        ]))
        .unwrap();

        assert!(config.daemonize);
        assert!(config.verbose);
        assert!(config.fastopen);
        assert_eq!(config.port, 5201);
        assert_eq!(config.egress_mark, Some(7));
        assert_eq!(config.ingress_mark, Some(8));
        assert_eq!(config.egress_cc.as_deref(), Some("cubic"));
        assert_eq!(config.ingress_cc.as_deref(), Some("hybla"));
        assert_eq!(config.dump_target, Some(DumpTarget::Stderr));
        assert_eq!(config.pending_lifetime, Duration::from_secs(10));
        assert_eq!(config.gc_interval, Duration::from_secs(5));
        assert_eq!(config.max_conns, 256);
    }

    #[test]
    fn dump_target_parses_paths() {
        assert_eq!(DumpTarget::parse("stdout"), DumpTarget::Stdout);
        assert_eq!(
            DumpTarget::parse("/var/run/pepd.status"),
            DumpTarget::File(PathBuf::from("/var/run/pepd.status"))
        );
    }

    #[test]
    fn conn_limit_is_bounded() {
        assert!(Config::new(parse(&["-c", "1"])).is_err());
        assert!(Config::new(parse(&["-c", "999999"])).is_err());
        assert!(Config::new(parse(&["-c", "128"])).is_ok());
    }

    #[test]
    fn mtu_must_exceed_header_floor() {
        assert!(Config::new(parse(&["-u", "80"])).is_err());
        let config = Config::new(parse(&["-u", "1500"])).unwrap();
        assert_eq!(config.ingress_mss, Some(1500 - 24 - 26));
    }

    #[test]
    fn mss_clamp_caps_at_max_window() {
        assert_eq!(mss_clamp(1500), 1450);
        assert_eq!(mss_clamp(100_000), MAX_TCP_WINDOW);
    }

    #[test]
    fn zero_marks_are_treated_as_unset() {
        let config = Config::new(parse(&["-m", "0", "-n", "0"])).unwrap();
        assert!(config.egress_mark.is_none());
        assert!(config.ingress_mark.is_none());
    }
}
