//! Controlling pseudo-terminal provisioning for launched workers.

use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::close;

use crate::protocol::TerminalMode;
use crate::stdio::{self, FileDescriptor};

/// Allocates a fresh pty pair: opens the multiplexer, grants and unlocks the
/// subordinate, and opens it.
pub fn allocate() -> Result<(PtyMaster, FileDescriptor)> {
    let master = posix_openpt(OFlag::O_RDWR).context("failed to open the pty multiplexer")?;
    grantpt(&master).context("failed to grant access to the pty subordinate")?;
    unlockpt(&master).context("failed to unlock the pty subordinate")?;
    let name = ptsname_r(&master).context("failed to resolve the pty subordinate path")?;
    let subordinate = nix::fcntl::open(name.as_str(), OFlag::O_RDWR, Mode::empty())
        .with_context(|| format!("failed to open pty subordinate {}", name))?;
    Ok((master, FileDescriptor::from(subordinate)))
}

/// Gives the calling process a fresh controlling terminal: allocates a pty
/// pair, applies the requested terminal mode and redirects the standard
/// streams to the subordinate end. The caller is expected to have called
/// setsid first, so opening the subordinate acquires it as the controlling
/// terminal. The returned multiplexer descriptor must stay open for the
/// lifetime of the terminal.
pub fn attach(tmode: &TerminalMode) -> Result<PtyMaster> {
    let (master, subordinate) = allocate()?;
    let termios = Termios::from(tmode.0);
    termios::tcsetattr(subordinate.as_raw_fd(), SetArg::TCSANOW, &termios)
        .context("failed to apply the requested terminal mode")?;
    stdio::connect_stdio(&subordinate, &subordinate, &subordinate)
        .context("failed to redirect standard streams to the pty")?;
    close(subordinate.as_raw_fd()).context("failed to close the pty subordinate")?;
    Ok(master)
}

/// Terminal mode of the caller's stdin, for clients forwarding their own
/// terminal settings.
pub fn current_mode() -> Result<TerminalMode> {
    let termios =
        termios::tcgetattr(libc::STDIN_FILENO).context("failed to read the terminal mode of stdin")?;
    Ok(TerminalMode(termios.into()))
}
