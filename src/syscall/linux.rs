//! Implements Syscall for Linux systems

use std::any::Any;
use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sched::{setns, CloneFlags};
use nix::unistd::{self, initgroups, setgid, setuid, Gid, Uid};

use super::Syscall;

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
        setns(rawfd, nstype)?;
        Ok(())
    }

    fn init_groups(&self, user: &str, gid: Gid) -> Result<()> {
        let user = CString::new(user).context("user name contains a NUL byte")?;
        initgroups(&user, gid)?;
        Ok(())
    }

    /// The GID must change while the process still has the privilege to do
    /// so; setuid comes strictly last.
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()> {
        setgid(gid)?;
        setuid(uid)?;
        Ok(())
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        unistd::chdir(path)?;
        Ok(())
    }
}
