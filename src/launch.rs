//! The launch pipeline: double fork, namespace entry, privilege drop and
//! final exec of the requested program.
//!
//! The worker has to be reparented away from the daemon, both so the daemon
//! never accumulates zombies and so it is not the session leader of what it
//! launches. The price of the double fork is that no standard syscall hands
//! the daemon the grandchild PID, hence the one-word shared mapping written
//! by the intermediate process.

use std::ffi::CStr;
use std::mem;
use std::process;
use std::ptr;

use anyhow::{Context, Result};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid, Uid};

use crate::namespaces::NetworkNamespace;
use crate::protocol::{Payload, RequestFlags, TerminalMode};
use crate::pty;
use crate::registry::Registry;
use crate::syscall::Syscall;
use crate::user;

/// One-word anonymous shared mapping transporting the worker PID from the
/// intermediate process back to the daemon. The intermediate writes and
/// exits before the daemon reads; waitpid provides the ordering, so no
/// further synchronization is needed.
pub struct SharedPid {
    cell: *mut libc::pid_t,
}

impl SharedPid {
    pub fn new() -> Result<Self> {
        let cell = unsafe {
            mman::mmap(
                ptr::null_mut(),
                mem::size_of::<libc::pid_t>(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
            .context("failed to map the shared pid cell")?
        };
        Ok(SharedPid {
            cell: cell as *mut libc::pid_t,
        })
    }

    pub fn put(&self, pid: Pid) {
        unsafe { *self.cell = pid.as_raw() };
    }

    pub fn take(&self) -> Pid {
        Pid::from_raw(unsafe { *self.cell })
    }

    /// Removes the mapping from the calling process. The worker does this
    /// first thing so the mapping never leaks into the exec'd program.
    pub fn unmap(&self) -> Result<()> {
        unsafe {
            mman::munmap(self.cell as *mut libc::c_void, mem::size_of::<libc::pid_t>())
                .context("failed to unmap the shared pid cell")?
        };
        Ok(())
    }
}

/// Runs one launch request to completion on the daemon side.
///
/// Failure of the first fork or of waitpid is returned to the caller and is
/// fatal to the daemon; everything that goes wrong past the first fork stays
/// inside the intermediate or the worker, which exit non-zero on their own.
pub fn launch(
    payload: &Payload,
    flags: RequestFlags,
    tmode: &TerminalMode,
    uid: Uid,
    registry: &mut Registry,
    pid_cell: &SharedPid,
    syscall: &dyn Syscall,
) -> Result<()> {
    registry.prune();
    if registry.is_full() {
        log::info!("worker capacity reached, skipping launch for uid {}", uid);
        return Ok(());
    }

    match unsafe { unistd::fork().context("fork failed")? } {
        ForkResult::Parent { child } => {
            waitpid(child, None).context("failed to wait for the intermediate process")?;
            let worker = pid_cell.take();
            registry.insert(uid, worker);
            log::info!("registered worker {} for uid {}", worker, uid);
            Ok(())
        }
        ForkResult::Child => {
            // Intermediate process. Its sole job is to fork the worker,
            // report the PID through the shared cell and get out of the way
            // so the worker is reparented to init.
            match unsafe { unistd::fork() } {
                Ok(ForkResult::Parent { child }) => {
                    pid_cell.put(child);
                    process::exit(0);
                }
                Ok(ForkResult::Child) => {
                    // Worker. Errors here must never travel back into the
                    // daemon.
                    if let Err(err) = worker_main(payload, flags, tmode, uid, pid_cell, syscall) {
                        log::warn!("worker failed before exec: {:#}", err);
                        process::exit(1);
                    }
                    unreachable!("worker_main only returns on error");
                }
                Err(err) => {
                    log::warn!("second fork failed: {}", err);
                    process::exit(1);
                }
            }
        }
    }
}

/// Everything the worker does between the second fork and execve. The
/// ordering is a contract: unmap, detach, terminal, namespace, identity,
/// exec.
fn worker_main(
    payload: &Payload,
    flags: RequestFlags,
    tmode: &TerminalMode,
    uid: Uid,
    pid_cell: &SharedPid,
    syscall: &dyn Syscall,
) -> Result<()> {
    pid_cell.unmap()?;
    unistd::setsid().context("failed to start a new session")?;

    if flags.contains(RequestFlags::NEW_PTY) {
        let master = pty::attach(tmode).context("failed to attach a controlling terminal")?;
        // The multiplexer must survive the exec for the terminal to work.
        mem::forget(master);
    }

    NetworkNamespace::new(payload.netns_path()).enter(syscall)?;
    user::drop_privileges(uid, syscall)?;

    let argv = argv_of(payload);
    unistd::execve(&payload.program, &argv, &payload.envs)
        .with_context(|| format!("failed to exec {:?}", payload.program))?;
    unreachable!("execve does not return on success");
}

/// argv for execve: the program itself in position 0, request arguments
/// after it. execve appends the terminating NULs itself.
fn argv_of(payload: &Payload) -> Vec<&CStr> {
    let mut argv = Vec::with_capacity(payload.args.len() + 1);
    argv.push(payload.program.as_c_str());
    argv.extend(payload.args.iter().map(|arg| arg.as_c_str()));
    argv
}
