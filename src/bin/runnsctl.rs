//! # runnsctl
//! Command line client for the runns daemon: assembles a launch, list or
//! stop request, submits it over the local socket and renders the reply.

use std::env;
use std::ffi::CString;
use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use runns::client;
use runns::forward::{self, NetnsSpec};
use runns::logger;
use runns::protocol::{
    path_to_cstring, OpMode, Payload, Request, RequestFlags, TerminalMode, DEFAULT_SOCKET,
};
use runns::pty;

#[derive(Parser, Debug)]
#[clap(version = "0.1.0")]
struct Opts {
    /// Program to run in the selected network namespace
    #[clap(short, long)]
    program: Option<PathBuf>,
    /// Network namespace file to switch into
    #[clap(long)]
    set_netns: Option<PathBuf>,
    /// Attach a fresh controlling terminal to the program
    #[clap(short, long)]
    create_ptms: bool,
    /// Stop the daemon (only root)
    #[clap(short, long)]
    stop: bool,
    /// List workers started on your behalf
    #[clap(short, long)]
    list: bool,
    /// <ip>;<port>;<netns path>[;<proto><family>] for the bind interposer,
    /// repeatable; family is 4 or 6
    #[clap(short, long)]
    forward_port: Vec<String>,
    /// Path to the runns socket
    #[clap(long)]
    socket: Option<PathBuf>,
    /// Be verbose
    #[clap(short, long)]
    verbose: bool,
    /// Arguments passed through to the program
    args: Vec<String>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.verbose {
        env::set_var("RUNNS_LOG_LEVEL", "debug");
    }
    if let Err(e) = logger::init(None) {
        eprintln!("log init failed: {:?}", e);
    }

    let request = build_request(&opts)?;
    let socket = opts
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));

    let mut stream = client::connect(&socket)?;
    client::submit(&mut stream, &request)?;

    if request.flags.contains(RequestFlags::LIST) {
        let records = client::fetch_list(&mut stream)?;
        client::render_list(io::stdout(), &records)?;
    }

    Ok(())
}

fn build_request(opts: &Opts) -> Result<Request> {
    let mut flags = RequestFlags::empty();
    if opts.stop {
        flags |= RequestFlags::STOP;
    }
    if opts.list {
        flags |= RequestFlags::LIST;
    }
    if opts.create_ptms {
        flags |= RequestFlags::NEW_PTY;
    }

    // The daemon applies the mode to a fresh pty, so it only makes sense
    // to capture one when we are asking for one.
    let tmode = if opts.create_ptms {
        pty::current_mode().context("failed to capture the terminal mode of stdin")?
    } else {
        TerminalMode::zeroed()
    };

    if flags.intersects(RequestFlags::STOP | RequestFlags::LIST) {
        return Ok(Request {
            flags,
            op_mode: OpMode::Unknown,
            tmode,
            payload: None,
        });
    }

    if !opts.forward_port.is_empty() && opts.set_netns.is_some() {
        bail!("--forward-port and --set-netns are mutually exclusive");
    }

    let program = opts
        .program
        .as_ref()
        .context("--program is required to launch")?;

    let specs: Vec<NetnsSpec> = opts
        .forward_port
        .iter()
        .map(|raw| raw.parse())
        .collect::<Result<_>>()?;

    let (op_mode, netns) = if !specs.is_empty() {
        // Port forwarding is resolved per-socket by the preloaded library;
        // the program itself stays in the namespace we are already in.
        (OpMode::ForwardPort, PathBuf::from("/proc/self/ns/net"))
    } else {
        let netns = opts
            .set_netns
            .clone()
            .context("--set-netns is required to launch")?;
        (OpMode::Netns, netns)
    };

    let mut envs = collect_environment()?;
    for (name, value) in forward::to_environment(&specs) {
        envs.push(
            CString::new(format!("{}={}", name, value))
                .context("forward entry contains a NUL byte")?,
        );
    }

    let args: Vec<CString> = opts
        .args
        .iter()
        .map(|arg| CString::new(arg.as_str()).context("argument contains a NUL byte"))
        .collect::<Result<_>>()?;

    log::debug!(
        "launching {:?} in {:?} with {} args and {} envs",
        program,
        netns,
        args.len(),
        envs.len()
    );

    Ok(Request {
        flags,
        op_mode,
        tmode,
        payload: Some(Payload {
            program: path_to_cstring(program)?,
            netns: path_to_cstring(&netns)?,
            args,
            envs,
        }),
    })
}

/// The complete caller environment, passed to the worker verbatim.
fn collect_environment() -> Result<Vec<CString>> {
    env::vars()
        .map(|(key, value)| {
            CString::new(format!("{}={}", key, value))
                .with_context(|| format!("environment variable {} contains a NUL byte", key))
        })
        .collect()
}
