//! An interface trait so that the launch pipeline can call the
//! identity- and namespace-switching syscalls without having to worry
//! about their implementation details

use std::any::Any;
use std::path::Path;

use anyhow::Result;
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};

use crate::syscall::linux::LinuxSyscall;
use crate::syscall::test::TestHelperSyscall;

/// Kernel functionality required to turn a forked child into a worker.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()>;
    fn init_groups(&self, user: &str, gid: Gid) -> Result<()>;
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()>;
    fn chdir(&self, path: &Path) -> Result<()>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::new(TestHelperSyscall::default())
    } else {
        Box::new(LinuxSyscall)
    }
}
