//! Init candidates and the exec chain that runs the first one that starts.
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::wait::WaitStatus;

use crate::syscall::Syscall;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    path: PathBuf,
    clone_flags: CloneFlags,
    tty_control: bool,
    args: Vec<String>,
    chroot: Option<PathBuf>,
}

impl InitCommand {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        InitCommand {
            path: path.into(),
            clone_flags: CloneFlags::empty(),
            tty_control: false,
            args: Vec::new(),
            chroot: None,
        }
    }

    pub fn clone_flags(mut self, flags: CloneFlags) -> Self {
        self.clone_flags = flags;
        self
    }

    pub fn tty_control(mut self, enabled: bool) -> Self {
        self.tty_control = enabled;
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Runs the command with `root` as its root directory. `path` is then
    /// resolved inside `root`.
    pub fn chroot<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.chroot = Some(root.into());
        self
    }
}

impl InitCommand {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> CloneFlags {
        self.clone_flags
    }

    pub fn wants_tty_control(&self) -> bool {
        self.tty_control
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn root(&self) -> Option<&Path> {
        self.chroot.as_deref()
    }

    /// Where the executable lives as seen from init.
    pub fn host_path(&self) -> PathBuf {
        match &self.chroot {
            Some(root) => root.join(self.path.strip_prefix("/").unwrap_or(&self.path)),
            None => self.path.clone(),
        }
    }
}

impl Display for InitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(root) = &self.chroot {
            write!(f, " (root {})", root.display())?;
        }
        Ok(())
    }
}

/// Tries each command in order and runs the first one that starts until it
/// exits. Other children exiting meanwhile are reaped.
///
/// Returns the command that ran, if any. At most one command is started.
pub fn run_commands<'a>(
    syscall: &dyn Syscall,
    cmds: &'a [InitCommand],
    env: &[(String, String)],
) -> Option<&'a InitCommand> {
    for cmd in cmds {
        let host_path = cmd.host_path();
        if let Err(e) = fs::metadata(&host_path) {
            log::debug!("skipping {}: {:?}: {}", cmd, host_path, e);
            continue;
        }

        log::debug!("Trying to run {}", cmd);
        let pid = match syscall.spawn(cmd, env) {
            Ok(pid) => pid,
            Err(e) => {
                log::warn!("Error starting {}: {}", cmd, e);
                continue;
            }
        };

        loop {
            match syscall.wait_any() {
                Ok(status) if status.pid() == Some(pid) => {
                    log_exit(&cmd.to_string(), status);
                    break;
                }
                Ok(status) => log_exit("orphan", status),
                Err(e) if e.errno() == Some(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("Error from wait for {}: {}", cmd, e);
                    break;
                }
            }
        }
        return Some(cmd);
    }

    None
}

pub(crate) fn log_exit(what: &str, status: WaitStatus) {
    match status {
        WaitStatus::Exited(pid, code) => {
            log::debug!("{} (pid {}) exited with status {}", what, pid, code)
        }
        WaitStatus::Signaled(pid, signal, _) => {
            log::debug!("{} (pid {}) killed by {}", what, pid, signal)
        }
        other => log::debug!("{}: {:?}", what, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_host_path() {
        let plain = InitCommand::new("/bin/sh");
        assert_eq!(plain.host_path(), PathBuf::from("/bin/sh"));
        let rooted = InitCommand::new("/sbin/init").chroot("/rootfs");
        assert_eq!(rooted.host_path(), PathBuf::from("/rootfs/sbin/init"));
        assert_eq!(rooted.to_string(), "/sbin/init (root /rootfs)");
    }

    #[test]
    fn test_missing_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cmds = vec![
            InitCommand::new(dir.path().join("inito")),
            InitCommand::new(dir.path().join("bin/sh")),
        ];
        let syscall = TestHelperSyscall::default();
        assert!(run_commands(&syscall, &cmds, &[]).is_none());
        assert!(syscall.get_spawn_args().is_empty());
    }

    #[test]
    fn test_first_started_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let uinit = dir.path().join("bbin/uinit");
        let sh = dir.path().join("bin/sh");
        touch(&uinit);
        touch(&sh);

        let cmds = vec![
            InitCommand::new(dir.path().join("inito")),
            InitCommand::new(&uinit).args(vec!["-v".to_string()]),
            InitCommand::new(&sh),
        ];
        let syscall = TestHelperSyscall::default();
        let pid = syscall.next_pid();
        syscall.push_wait_status(WaitStatus::Exited(Pid::from_raw(4242), 0));
        syscall.push_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false));

        let ran = run_commands(&syscall, &cmds, &[]).unwrap();
        assert_eq!(ran.path(), uinit);
        let spawned = syscall.get_spawn_args();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].cmd.arguments(), ["-v".to_string()]);
        assert_eq!(syscall.pending_wait_statuses(), 0);
    }

    #[test]
    fn test_failed_start_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let uinit = dir.path().join("bin/uinit");
        let sh = dir.path().join("bin/sh");
        touch(&uinit);
        touch(&sh);

        let cmds = vec![InitCommand::new(&uinit), InitCommand::new(&sh)];
        let syscall = TestHelperSyscall::default();
        syscall.fail_spawn(&uinit, Errno::EACCES);
        let pid = syscall.next_pid();
        syscall.push_wait_status(WaitStatus::Exited(pid, 0));

        let ran = run_commands(&syscall, &cmds, &[]).unwrap();
        assert_eq!(ran.path(), sh);
        assert_eq!(syscall.get_spawn_args().len(), 2);
    }
}
