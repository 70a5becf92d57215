use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::unistd::dup2;

#[derive(Debug, Clone, Copy)]
pub struct FileDescriptor(RawFd);

const STDIN: RawFd = 0;
const STDOUT: RawFd = 1;
const STDERR: RawFd = 2;

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl From<RawFd> for FileDescriptor {
    fn from(fd: RawFd) -> Self {
        FileDescriptor(fd)
    }
}

pub fn connect_stdio(
    stdin: &FileDescriptor,
    stdout: &FileDescriptor,
    stderr: &FileDescriptor,
) -> Result<()> {
    dup2(stdin.as_raw_fd(), STDIN).context("failed to redirect stdin")?;
    dup2(stdout.as_raw_fd(), STDOUT).context("failed to redirect stdout")?;
    dup2(stderr.as_raw_fd(), STDERR).context("failed to redirect stderr")?;
    Ok(())
}
