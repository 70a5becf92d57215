//! The runns daemon: socket lifecycle, peer authentication and request
//! dispatch.
//!
//! The daemon is single-threaded and strictly serial over the accept loop;
//! all concurrency lives in the forked workers. Everything the daemon owns
//! (listener, registry, shared pid cell, socket directory) is collected in
//! one value with one lifetime instead of process-wide globals.

use std::fs;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::socket::{self, sockopt, AddressFamily, SockAddr, SockFlag, SockType, UnixAddr};
use nix::sys::stat::{self, FchmodatFlags, Mode};
use nix::unistd::{self, close, Gid, Group, Uid};

use crate::launch::{self, SharedPid};
use crate::protocol::{self, Payload, RequestFlags, RequestHeader};
use crate::registry::Registry;
use crate::syscall::{create_syscall, Syscall};
use crate::utils;

/// Group whose members may talk to the daemon.
const SOCKET_GROUP: &str = "runns";
const LISTEN_BACKLOG: usize = 16;

pub struct Config {
    /// Socket path override; `None` selects the default under
    /// `/var/run/runns/`, whose directory lifetime the daemon then manages.
    pub socket: Option<PathBuf>,
    pub max_workers: usize,
}

pub struct Daemon {
    socket_path: PathBuf,
    socket_dir: PathBuf,
    default_path: bool,
    listener: RawFd,
    registry: Registry,
    pid_cell: SharedPid,
    syscall: Box<dyn Syscall>,
}

impl Daemon {
    /// Verifies the invocation, detaches from the terminal and binds the
    /// listener. After this returns the process is a daemon; everything it
    /// reports goes through the log.
    pub fn new(config: Config) -> Result<Self> {
        if !Uid::effective().is_root() {
            bail!("the runns daemon must be started by root");
        }
        let group = Group::from_name(SOCKET_GROUP)
            .context("failed to look up the runns group")?
            .ok_or_else(|| anyhow!("the {} group does not exist", SOCKET_GROUP))?;

        let (socket_path, default_path) = match config.socket {
            Some(path) => (path, false),
            None => (PathBuf::from(protocol::DEFAULT_SOCKET), true),
        };
        let socket_dir = socket_path
            .parent()
            .context("socket path has no parent directory")?
            .to_path_buf();

        // Mapped before any fork so every process in the pipeline shares it.
        let pid_cell = SharedPid::new()?;

        unistd::daemon(false, false).context("failed to daemonize")?;
        stat::umask(Mode::from_bits_truncate(0o022));

        prepare_socket_path(&socket_path, &socket_dir, default_path)?;
        let listener = bind_listener(&socket_path, group.gid)?;
        log::info!("runns daemon has started on {:?}", socket_path);

        Ok(Daemon {
            socket_path,
            socket_dir,
            default_path,
            listener,
            registry: Registry::new(config.max_workers),
            pid_cell,
            syscall: create_syscall(),
        })
    }

    /// Serves requests until a root STOP arrives or a fatal error occurs,
    /// then tears the socket state down either way.
    pub fn run(&mut self) -> Result<()> {
        let result = self.serve();
        self.shutdown();
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            // The worker closes this connection before forking, but marking
            // it close-on-exec keeps it out of the exec image even if that
            // ever changes.
            let fd = socket::accept4(self.listener, SockFlag::SOCK_CLOEXEC)
                .context("accept failed")?;
            let mut stream = unsafe { UnixStream::from_raw_fd(fd) };

            let cred = match socket::getsockopt(stream.as_raw_fd(), sockopt::PeerCredentials) {
                Ok(cred) => cred,
                Err(err) => {
                    log::warn!("failed to read peer credentials: {}", err);
                    continue;
                }
            };
            let peer = Uid::from_raw(cred.uid());

            let header = match RequestHeader::read_from(&mut stream) {
                Ok(header) => header,
                Err(err) => {
                    log::warn!("failed to read request header from uid {}: {:#}", peer, err);
                    continue;
                }
            };

            if header.flags.contains(RequestFlags::STOP) {
                if peer.is_root() {
                    log::info!("stop requested, closing");
                    return Ok(());
                }
                log::warn!("uid {} tried to stop the daemon", peer);
                continue;
            }

            if header.flags.contains(RequestFlags::LIST) {
                log::info!("uid {} asked for its worker list", peer);
                if let Err(err) = self.send_list(&mut stream, peer) {
                    log::warn!("failed to send the worker list to uid {}: {:#}", peer, err);
                }
                continue;
            }

            self.handle_launch(stream, &header, peer)?;
        }
    }

    fn send_list(&mut self, stream: &mut UnixStream, peer: Uid) -> Result<()> {
        self.registry.prune();
        let records = self.registry.list_for(peer);
        protocol::write_list_reply(stream, &records)
    }

    /// Decodes and runs one launch. Malformed payloads poison only their
    /// connection; a fork failure comes back as an error and takes the
    /// daemon down.
    fn handle_launch(
        &mut self,
        mut stream: UnixStream,
        header: &RequestHeader,
        peer: Uid,
    ) -> Result<()> {
        let payload = match Payload::read_from(&mut stream, header) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("malformed launch request from uid {}: {:#}", peer, err);
                return Ok(());
            }
        };
        log::info!(
            "uid={} program={:?} netns={:?} op_mode={:?}",
            peer,
            payload.program,
            payload.netns,
            header.op_mode
        );

        // The connection is done; the worker must not inherit it.
        drop(stream);

        launch::launch(
            &payload,
            header.flags,
            &header.tmode,
            peer,
            &mut self.registry,
            &self.pid_cell,
            self.syscall.as_ref(),
        )
    }

    /// Best-effort teardown: surviving workers keep running, the daemon
    /// merely forgets them.
    fn shutdown(&mut self) {
        log::info!("runns daemon going down");
        let _ = close(self.listener);
        let _ = fs::remove_file(&self.socket_path);
        if self.default_path {
            let _ = fs::remove_dir(&self.socket_dir);
        }
        let _ = self.pid_cell.unmap();
    }
}

/// Applies the stale-socket policy. Only the default location gets directory
/// management; an overridden path is taken as given.
fn prepare_socket_path(socket_path: &Path, socket_dir: &Path, default_path: bool) -> Result<()> {
    if !default_path {
        return Ok(());
    }

    if socket_path.exists() {
        log::warn!("removing stale socket file {:?}", socket_path);
        fs::remove_file(socket_path).context("failed to remove the stale socket file")?;
    } else if !socket_dir.exists() {
        utils::create_dir_all_with_mode(
            socket_dir,
            Uid::effective().as_raw(),
            Mode::from_bits_truncate(0o755),
        )?;
    }
    Ok(())
}

/// Binds the listener with close-on-exec set and hands the socket file over
/// to the runns group so its members may connect.
fn bind_listener(path: &Path, group: Gid) -> Result<RawFd> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("failed to create the listener socket")?;
    let addr = SockAddr::Unix(UnixAddr::new(path)?);
    socket::bind(fd, &addr).with_context(|| format!("failed to bind {:?}", path))?;
    unistd::chown(path, Some(Uid::from_raw(0)), Some(group))
        .context("failed to hand the socket file over to the runns group")?;
    stat::fchmodat(
        None,
        path,
        Mode::from_bits_truncate(0o775),
        FchmodatFlags::FollowSymlink,
    )
    .context("failed to set socket file permissions")?;
    socket::listen(fd, LISTEN_BACKLOG).context("failed to listen on the socket")?;
    Ok(fd)
}
