//! Dropping daemon privileges down to the requesting user.

use anyhow::{bail, Context, Result};
use nix::unistd::{Uid, User};

use crate::syscall::Syscall;

/// Switches the calling process to the identity of the user with the given
/// UID: supplementary groups first, then the GID, then the UID, and finally
/// the working directory becomes the user's home.
pub fn drop_privileges(uid: Uid, syscall: &dyn Syscall) -> Result<()> {
    let user = match User::from_uid(uid).context("failed to look up the requesting user")? {
        Some(user) => user,
        None => bail!("no user record for uid {}", uid),
    };

    syscall.init_groups(&user.name, user.gid).with_context(|| {
        format!(
            "failed to initialize supplementary groups for {}",
            user.name
        )
    })?;
    syscall
        .set_id(user.uid, user.gid)
        .with_context(|| format!("failed to switch to uid={} gid={}", user.uid, user.gid))?;
    syscall
        .chdir(&user.dir)
        .with_context(|| format!("failed to enter home directory {:?} of {}", user.dir, user.name))?;

    Ok(())
}
