//! Process startup: option parsing, logging, daemonization, signal
//! arrangement, and spawning the engine threads.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use nix::sys::signal;
use signal_hook::{consts, iterator::Signals};

use crate::core::configuration::{CliOptions, Config, POOL_WORKERS};
use crate::core::listener::Listener;
use crate::core::status::StatusDumper;
use crate::core::{logger, poller, timer, worker, PepContext};

/// Main entry point for the proxy.
pub fn run_pepd() -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    // parse the options from the command line
    let options = match CliOptions::try_parse() {
        Ok(x) => x,
        Err(e) => {
            // will print to either stdout or stderr with formatting
            e.print().unwrap();
            if e.use_stderr() {
                // the `clap::Error` represents an error (ex: invalid flag)
                std::process::exit(1);
            } else {
                // the `clap::Error` represents a non-error, but we'll want
                // to exit anyways (ex: '--help', '--version')
                std::process::exit(0);
            }
        }
    };

    let config = Config::new(options).context("Resolving the configuration")?;

    let log_level = if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logger::init(log_level).context("Installing the logger")?;

    if !nix::unistd::geteuid().is_root() {
        log::warn!(
            "pepd is not running as root. Transparent binding (IP_TRANSPARENT) \
            requires CAP_NET_ADMIN, so startup will likely fail unless the \
            capability was granted another way."
        );
    }

    if config.daemonize {
        log::debug!("daemonizing");
        // keep stderr attached; the logger and status dump may use it
        nix::unistd::daemon(false, true).context("Daemonizing")?;
    }

    // A peer that vanishes mid-write must surface as EPIPE on the worker's
    // write call, not kill the process. Blocked before any thread spawns
    // so every thread inherits the mask.
    let mut sigpipe = signal::SigSet::empty();
    sigpipe.add(signal::Signal::SIGPIPE);
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&sigpipe), None)
        .context("Blocking SIGPIPE")?;

    let mut signals_list = Signals::new([consts::signal::SIGINT, consts::signal::SIGTERM])
        .context("Installing termination signal handling")?;
    thread::Builder::new()
        .name("pep-signals".to_string())
        .spawn(move || {
            // blocks until a termination signal arrives
            if let Some(signal) = signals_list.forever().next() {
                log::info!("Received signal {}. Flushing log and exiting", signal);
                log::logger().flush();
                std::process::exit(0);
            }
        })
        .context("Spawning the signal thread")?;

    // the status dump destination and the listening socket are fixed
    // inputs; failing to set either up is fatal
    let dumper = config
        .dump_target
        .as_ref()
        .map(StatusDumper::open)
        .transpose()
        .context("Opening the status dump destination")?;
    let listener = Listener::bind(&config).context("Setting up the listener")?;

    log::info!(
        "Starting pepd {} on port {} (max {} connections)",
        version,
        config.port,
        config.max_conns
    );

    let ctx = PepContext::new(config).context("Allocating shared state")?;

    for i in 0..POOL_WORKERS {
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name(format!("pep-worker-{}", i))
            .spawn(move || worker::worker_loop(&ctx))
            .with_context(|| format!("Spawning worker thread {}", i))?;
    }

    {
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name("pep-timer".to_string())
            .spawn(move || timer::timer_loop(&ctx, dumper))
            .context("Spawning the timer thread")?;
    }

    {
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name("pep-listener".to_string())
            .spawn(move || listener.accept_loop(ctx))
            .context("Spawning the listener thread")?;
    }

    let poller_handle = {
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name("pep-poller".to_string())
            .spawn(move || poller::poller_loop(ctx))
            .context("Spawning the poller thread")?
    };

    // the poller only returns on a fatal multiplexer error; everything
    // else runs until the process is signalled
    poller_handle
        .join()
        .expect("poller thread panicked")
        .map_err(|e| e.context("Poller failed"))
}
