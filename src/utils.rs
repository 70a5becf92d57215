//! Utility functionality

use std::fs::{self, DirBuilder};
use std::ops::Deref;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sys::stat::Mode;

/// Creates the specified directory and all parent directories with the
/// specified mode, then verifies that the result is a directory with the
/// expected owner and permission bits.
pub fn create_dir_all_with_mode<P: AsRef<Path>>(path: P, owner: u32, mode: Mode) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(mode.bits())
            .create(path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("failed to get metadata for {}", path.display()))?;

    if metadata.is_dir()
        && metadata.st_uid() == owner
        && metadata.st_mode() & mode.bits() == mode.bits()
    {
        Ok(())
    } else {
        bail!(
            "metadata for {} does not possess the expected attributes",
            path.display()
        );
    }
}

pub struct TempDir {
    path: Option<PathBuf>,
}

impl TempDir {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let p = path.into();
        fs::create_dir_all(&p)
            .with_context(|| format!("failed to create directory {}", p.display()))?;
        Ok(Self { path: Some(p) })
    }

    pub fn path(&self) -> &Path {
        self.path
            .as_ref()
            .expect("temp dir has already been removed")
    }

    pub fn remove(&mut self) {
        if let Some(p) = &self.path {
            let _ = fs::remove_dir_all(p);
            self.path = None;
        }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        self.remove();
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

impl Deref for TempDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.path()
    }
}

pub fn create_temp_dir(test_name: &str) -> Result<TempDir> {
    let dir = TempDir::new(std::env::temp_dir().join(test_name))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd::Uid;

    #[test]
    fn test_create_dir_all_with_mode() {
        let tmp = create_temp_dir("test_create_dir_all_with_mode").unwrap();
        let target = tmp.join("sub");
        create_dir_all_with_mode(&target, Uid::effective().as_raw(), Mode::from_bits_truncate(0o755))
            .unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_create_dir_all_with_mode_wrong_owner() {
        let tmp = create_temp_dir("test_create_dir_all_with_mode_wrong_owner").unwrap();
        let target = tmp.join("sub");
        let not_me = Uid::effective().as_raw().wrapping_add(1);
        assert!(
            create_dir_all_with_mode(&target, not_me, Mode::from_bits_truncate(0o755)).is_err()
        );
    }

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let path;
        {
            let tmp = create_temp_dir("test_temp_dir_removed_on_drop").unwrap();
            path = tmp.to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
