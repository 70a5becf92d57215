//! Contains a wrapper of syscalls for unit tests

#[allow(clippy::module_inception)]
mod syscall;
pub mod linux;

pub use syscall::{create_syscall, Syscall};
