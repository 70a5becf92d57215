//! # runns
//! A privileged daemon that runs programs inside Linux network namespaces on
//! behalf of unprivileged local clients. Clients talk to it over a local
//! socket with runnsctl; the daemon authenticates them by peer credentials
//! and launches workers under their own identity.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use runns::daemon::{Config, Daemon};
use runns::logger;

#[derive(Parser, Debug)]
#[clap(version = "0.1.0")]
struct Opts {
    /// Override the default runns socket path (/var/run/runns/runns.socket)
    #[clap(short, long)]
    socket: Option<PathBuf>,
    /// File receiving daemon logs; stderr is gone once daemonized
    #[clap(short, long, default_value = "/var/log/runns.log")]
    log: PathBuf,
    /// Upper bound on concurrently tracked workers
    #[clap(long, default_value = "1024")]
    max_workers: usize,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = logger::init(Some(opts.log)) {
        eprintln!("log init failed: {:?}", e);
    }

    let result = Daemon::new(Config {
        socket: opts.socket,
        max_workers: opts.max_workers,
    })
    .and_then(|mut daemon| daemon.run());

    // stderr is /dev/null once daemonized, so fatal errors go to the log.
    if let Err(err) = &result {
        log::error!("runns daemon failed: {:#}", err);
    }
    result
}
