//! Implements Syscall trait for Linux systems
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::{any::Any, path::Path, path::PathBuf};

use libc::{c_char, c_short, IFF_UP, IFNAMSIZ};
use nix::errno::Errno;
use nix::kmod::{finit_module, ModuleInitFlags};
use nix::mount::{mount, MsFlags};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Pid};
use nix::{ioctl_read_bad, ioctl_write_ptr_bad};

use super::{Result, Syscall, SyscallError};
use crate::loopdev::LoopControl;
use crate::process::command::InitCommand;
use crate::process::fork;

/// Layout of `struct ifreq` when only the flags member is used.
#[repr(C)]
struct IfReqFlags {
    name: [c_char; IFNAMSIZ],
    flags: c_short,
    _pad: [u8; 22],
}

ioctl_read_bad!(siocgifflags, libc::SIOCGIFFLAGS, IfReqFlags);
ioctl_write_ptr_bad!(siocsifflags, libc::SIOCSIFFLAGS, IfReqFlags);

/// Empty structure to implement Syscall trait for
#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    /// To enable dynamic typing,
    /// see https://doc.rust-lang.org/std/any/index.html for more information
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| SyscallError::Mount {
            source_path: source.map(|x| x.to_owned()),
            target: target.to_owned(),
            fstype: fstype.unwrap_or_default().to_owned(),
            errno,
        })
    }

    fn sync(&self) -> Result<()> {
        unistd::sync();
        Ok(())
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        Ok(LoopControl::default().attach(image)?)
    }

    fn spawn(&self, cmd: &InitCommand, env: &[(String, String)]) -> Result<Pid> {
        fork::spawn(cmd, env).map_err(|errno| SyscallError::Spawn {
            path: cmd.path().to_owned(),
            errno,
        })
    }

    fn wait_any(&self) -> Result<WaitStatus> {
        waitpid(Pid::from_raw(-1), None).map_err(SyscallError::Wait)
    }

    fn load_module(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| SyscallError::OpenModule {
            path: path.to_owned(),
            source,
        })?;
        match finit_module(&file, &CString::default(), ModuleInitFlags::empty()) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => Err(SyscallError::LoadModule {
                path: path.to_owned(),
                errno,
            }),
        }
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        let link_err = |errno| SyscallError::LinkUp {
            name: name.to_owned(),
            errno,
        };
        if name.len() >= IFNAMSIZ {
            return Err(link_err(Errno::EINVAL));
        }

        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(link_err)?;
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req = IfReqFlags {
            name: [0; IFNAMSIZ],
            flags: 0,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }

        unsafe { siocgifflags(sock.as_raw_fd(), &mut req) }.map_err(link_err)?;
        req.flags |= IFF_UP as c_short;
        unsafe { siocsifflags(sock.as_raw_fd(), &req) }.map_err(link_err)?;
        Ok(())
    }
}
