//! An interface trait so that rest of init can call
//! necessary functions without having to worry about their
//! implementation details
use std::{any::Any, io, path::Path, path::PathBuf};

use nix::{errno::Errno, mount::MsFlags, sys::wait::WaitStatus, unistd::Pid};

use crate::loopdev::LoopError;
use crate::process::command::InitCommand;
use crate::syscall::{linux::LinuxSyscall, test::TestHelperSyscall};

pub type Result<T> = std::result::Result<T, SyscallError>;

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("failed to mount {source_path:?} on {target:?} as {fstype}: {errno}")]
    Mount {
        source_path: Option<PathBuf>,
        target: PathBuf,
        fstype: String,
        errno: Errno,
    },
    #[error("failed to sync filesystems: {0}")]
    Sync(Errno),
    #[error("failed to start {path:?}: {errno}")]
    Spawn { path: PathBuf, errno: Errno },
    #[error("wait for children failed: {0}")]
    Wait(Errno),
    #[error("failed to open module {path:?}")]
    OpenModule {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to load module {path:?}: {errno}")]
    LoadModule { path: PathBuf, errno: Errno },
    #[error("failed to bring up interface {name}: {errno}")]
    LinkUp { name: String, errno: Errno },
    #[error(transparent)]
    Loop(#[from] LoopError),
}

impl SyscallError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SyscallError::Mount { errno, .. }
            | SyscallError::Spawn { errno, .. }
            | SyscallError::LoadModule { errno, .. }
            | SyscallError::LinkUp { errno, .. } => Some(*errno),
            SyscallError::Sync(errno) | SyscallError::Wait(errno) => Some(*errno),
            SyscallError::OpenModule { .. } | SyscallError::Loop(_) => None,
        }
    }
}

/// Kernel side effects of the boot path.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    /// Flushes every mounted filesystem to disk.
    fn sync(&self) -> Result<()>;
    /// Binds `image` to a free loop device and returns the device node.
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;
    /// Returns once `cmd` has either exec'd or failed to.
    fn spawn(&self, cmd: &InitCommand, env: &[(String, String)]) -> Result<Pid>;
    /// Blocks until any child changes state.
    fn wait_any(&self) -> Result<WaitStatus>;
    fn load_module(&self, path: &Path) -> Result<()>;
    fn set_link_up(&self, name: &str) -> Result<()>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::new(TestHelperSyscall::default())
    } else {
        Box::new(LinuxSyscall)
    }
}
