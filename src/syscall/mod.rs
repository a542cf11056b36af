//! Contains a wrapper of syscalls for unit tests
//! This provides a uniform interface for rest of init
//! to call syscalls required for booting

#[allow(clippy::module_inception)]
pub mod syscall;
pub mod linux;

pub use syscall::{create_syscall, Result, Syscall, SyscallError};
