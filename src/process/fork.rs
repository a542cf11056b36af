use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::c_int;
use libc::c_void;
use nix::errno::Errno;
use nix::sched;
use nix::sys::wait::waitpid;
use nix::unistd::{self, Pid};

use crate::pipe::Pipe;
use crate::process::command::InitCommand;

pub fn clone(mut cb: sched::CloneCb, clone_flags: sched::CloneFlags) -> nix::Result<Pid> {
    extern "C" fn callback(data: *mut sched::CloneCb) -> c_int {
        let cb: &mut sched::CloneCb = unsafe { &mut *data };
        (*cb)() as c_int
    }

    let (child_stack, stack_size) = unsafe {
        let page_size: usize = match libc::sysconf(libc::_SC_PAGE_SIZE) {
            -1 => 4 * 1024, // default to 4K page size
            x => x as usize,
        };

        let mut rlimit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        Errno::result(libc::getrlimit(libc::RLIMIT_STACK, &mut rlimit))?;
        let default_stack_size = match rlimit.rlim_cur {
            libc::RLIM_INFINITY => 8 * 1024 * 1024,
            x => x as usize,
        };

        let child_stack = libc::mmap(
            libc::PT_NULL as *mut c_void,
            default_stack_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        );
        if child_stack == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        // Guard page at the bottom of the stack.
        Errno::result(libc::mprotect(child_stack, page_size, libc::PROT_NONE))?;

        (child_stack, default_stack_size)
    };

    let res = unsafe {
        let signal = nix::sys::signal::Signal::SIGCHLD;
        let combined = clone_flags.bits() | signal as c_int;
        libc::clone(
            mem::transmute(callback as extern "C" fn(*mut Box<dyn FnMut() -> isize>) -> i32),
            child_stack.add(stack_size),
            combined,
            &mut cb as *mut _ as *mut c_void,
        )
    };

    // Without CLONE_VM the child runs on its own copy of the mapping.
    unsafe {
        libc::munmap(child_stack, stack_size);
    }

    Errno::result(res).map(Pid::from_raw)
}

fn to_cstring(bytes: &[u8]) -> nix::Result<CString> {
    CString::new(bytes).map_err(|_| Errno::EINVAL)
}

fn path_cstring(path: &Path) -> nix::Result<CString> {
    to_cstring(path.as_os_str().as_bytes())
}

// Runs in the child between clone and exec, so it must not allocate or log.
fn exec_child(
    path: &CStr,
    argv: &[CString],
    envp: &[CString],
    root: Option<&CStr>,
    tty_control: bool,
) -> nix::Result<Infallible> {
    if let Some(root) = root {
        unistd::chroot(root)?;
        unistd::chdir("/")?;
    }

    if tty_control {
        unistd::setsid()?;
        Errno::result(unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 1) })?;
    }

    unistd::execve(path, argv, envp)
}

/// Starts `cmd` and waits until its exec either succeeded or failed.
///
/// A child whose exec failed is reaped here, so an error means no process
/// was left behind.
pub fn spawn(cmd: &InitCommand, env: &[(String, String)]) -> nix::Result<Pid> {
    let path = path_cstring(cmd.path())?;
    let mut argv = vec![path.clone()];
    for arg in cmd.arguments() {
        argv.push(to_cstring(arg.as_bytes())?);
    }
    let envp = env
        .iter()
        .map(|(key, value)| to_cstring(format!("{}={}", key, value).as_bytes()))
        .collect::<nix::Result<Vec<_>>>()?;
    let root = cmd.root().map(path_cstring).transpose()?;
    let tty_control = cmd.wants_tty_control();

    let pipe = Pipe::new()?;
    let cloned = clone(
        Box::new(|| {
            let errno = match exec_child(&path, &argv, &envp, root.as_deref(), tty_control) {
                Err(errno) => errno,
                Ok(never) => match never {},
            };
            pipe.report(errno);
            unsafe { libc::_exit(127) }
        }),
        cmd.flags(),
    );

    let pid = match cloned {
        Ok(pid) => pid,
        Err(errno) => {
            pipe.close();
            return Err(errno);
        }
    };

    match pipe.wait_exec() {
        Ok(()) => Ok(pid),
        Err(errno) => {
            let _ = waitpid(pid, None);
            Err(errno)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use nix::sys::wait::WaitStatus;

    #[test]
    fn test_fork_clone() -> Result<()> {
        let cb = || -> Result<()> {
            // In a new pid namespace, pid of this process should be 1
            let pid = unistd::getpid();
            assert_eq!(unistd::Pid::from_raw(1), pid, "PID should set to 1");

            Ok(())
        };

        // For now, we test clone with new pid and user namespace. user
        // namespace is needed for the test to run without root
        let flags = sched::CloneFlags::CLONE_NEWPID | sched::CloneFlags::CLONE_NEWUSER;
        let pid = super::clone(
            Box::new(|| {
                if cb().is_err() {
                    return -1;
                }

                0
            }),
            flags,
        )?;

        let status = waitpid(pid, None)?;
        if let WaitStatus::Exited(_, exit_code) = status {
            assert_eq!(
                0, exit_code,
                "Process didn't exit correctly {:?}",
                exit_code
            );

            return Ok(());
        }

        bail!("Process didn't exit correctly")
    }

    #[test]
    fn test_spawn_reports_exit_code() -> Result<()> {
        let cmd = InitCommand::new("/bin/sh").args(vec!["-c".to_string(), "exit 3".to_string()]);
        let pid = spawn(&cmd, &[("PATH".to_string(), "/bin".to_string())])?;
        assert_eq!(waitpid(pid, None)?, WaitStatus::Exited(pid, 3));
        Ok(())
    }

    #[test]
    fn test_spawn_missing_executable() {
        let cmd = InitCommand::new("/nonexistent/uinit");
        assert_eq!(spawn(&cmd, &[]), Err(Errno::ENOENT));
    }

    #[test]
    fn test_spawn_non_executable_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("uinit");
        std::fs::write(&path, b"not a program")?;
        let cmd = InitCommand::new(&path);
        assert_eq!(spawn(&cmd, &[]), Err(Errno::EACCES));
        Ok(())
    }
}
