//! Network namespace entry. A namespace is entered by opening its
//! bind-mounted file (as created by `ip netns add`) and calling setns(2)
//! with the resulting descriptor, which requires CAP_SYS_ADMIN and is why
//! the daemon exists at all.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::fcntl;
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::syscall::Syscall;

#[derive(Debug, Clone)]
pub struct NetworkNamespace {
    path: PathBuf,
}

impl NetworkNamespace {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        NetworkNamespace { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the calling process into this network namespace.
    pub fn enter(&self, syscall: &dyn Syscall) -> Result<()> {
        let fd = fcntl::open(
            &self.path,
            fcntl::OFlag::O_RDONLY | fcntl::OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("failed to open namespace file {:?}", self.path))?;
        syscall
            .set_ns(fd, CloneFlags::CLONE_NEWNET)
            .with_context(|| format!("failed to enter namespace {:?}", self.path))?;
        close(fd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_enter_uses_setns_with_newnet() {
        let syscall = TestHelperSyscall::default();
        let ns = NetworkNamespace::new("/dev/null");
        assert!(ns.enter(&syscall).is_ok());

        let args = syscall.get_set_ns_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].1, CloneFlags::CLONE_NEWNET);
    }

    #[test]
    fn test_enter_missing_namespace_file() {
        let syscall = TestHelperSyscall::default();
        let ns = NetworkNamespace::new("/nonexistent/netns/blue");
        assert!(ns.enter(&syscall).is_err());
        assert!(syscall.get_set_ns_args().is_empty());
    }
}
