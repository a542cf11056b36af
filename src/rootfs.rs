//! The minimal filesystem layout every boot starts from.
use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;

use crate::syscall::Syscall;

pub const LOOPBACK: &str = "lo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir {
        path: &'static str,
        mode: u32,
    },
    Mount {
        source: &'static str,
        target: &'static str,
        fstype: &'static str,
        flags: MsFlags,
        data: Option<&'static str>,
    },
    Symlink {
        original: &'static str,
        link: &'static str,
    },
}

/// Entries in creation order. Directories under a mount point come after
/// the mount so they land on the new filesystem.
pub fn namespace() -> Vec<Entry> {
    let nosuid_nodev = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    let nosuid_nodev_noexec = nosuid_nodev | MsFlags::MS_NOEXEC;

    vec![
        Entry::Dir { path: "/etc", mode: 0o755 },
        Entry::Dir { path: "/env", mode: 0o777 },
        Entry::Dir { path: "/ubin", mode: 0o777 },
        Entry::Dir { path: "/usr/lib", mode: 0o755 },
        Entry::Dir { path: "/var/log", mode: 0o777 },
        Entry::Dir { path: "/tmp", mode: 0o1777 },
        Entry::Dir { path: "/run", mode: 0o755 },
        Entry::Dir { path: "/proc", mode: 0o555 },
        Entry::Dir { path: "/sys", mode: 0o555 },
        Entry::Dir { path: "/dev", mode: 0o755 },
        Entry::Mount {
            source: "proc",
            target: "/proc",
            fstype: "proc",
            flags: nosuid_nodev_noexec,
            data: None,
        },
        Entry::Mount {
            source: "sysfs",
            target: "/sys",
            fstype: "sysfs",
            flags: nosuid_nodev_noexec,
            data: None,
        },
        Entry::Mount {
            source: "devtmpfs",
            target: "/dev",
            fstype: "devtmpfs",
            flags: MsFlags::MS_NOSUID,
            data: Some("mode=0755"),
        },
        Entry::Dir { path: "/dev/pts", mode: 0o755 },
        Entry::Mount {
            source: "devpts",
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: Some("newinstance,ptmxmode=666,gid=5,mode=620"),
        },
        Entry::Mount {
            source: "tmpfs",
            target: "/tmp",
            fstype: "tmpfs",
            flags: nosuid_nodev,
            data: Some("mode=1777"),
        },
        Entry::Mount {
            source: "tmpfs",
            target: "/run",
            fstype: "tmpfs",
            flags: nosuid_nodev,
            data: Some("mode=0755"),
        },
        Entry::Symlink { original: "/dev/pts/ptmx", link: "/dev/ptmx" },
        Entry::Symlink { original: "/proc/self/fd", link: "/dev/fd" },
        Entry::Symlink { original: "/proc/self/fd/0", link: "/dev/stdin" },
        Entry::Symlink { original: "/proc/self/fd/1", link: "/dev/stdout" },
        Entry::Symlink { original: "/proc/self/fd/2", link: "/dev/stderr" },
    ]
}

fn under(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

impl Entry {
    fn create(&self, syscall: &dyn Syscall, root: &Path) -> Result<()> {
        match *self {
            Entry::Dir { path, mode } => {
                let path = under(root, path);
                DirBuilder::new()
                    .recursive(true)
                    .mode(mode)
                    .create(&path)
                    .with_context(|| format!("failed to create {:?}", path))?;
            }
            Entry::Mount {
                source,
                target,
                fstype,
                flags,
                data,
            } => {
                syscall.mount(
                    Some(Path::new(source)),
                    &under(root, target),
                    Some(fstype),
                    flags,
                    data,
                )?;
            }
            Entry::Symlink { original, link } => {
                let link = under(root, link);
                match symlink(original, &link) {
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    other => other.with_context(|| format!("failed to link {:?}", link))?,
                }
            }
        }
        Ok(())
    }
}

/// Creates every entry of [`namespace`] below `root`. Failures are logged and
/// skipped. Returns how many entries failed.
pub fn create_rootfs(syscall: &dyn Syscall, root: &Path) -> usize {
    let mut failures = 0;
    for entry in namespace() {
        if let Err(e) = entry.create(syscall, root) {
            log::warn!("{:?}: {:#}", entry, e);
            failures += 1;
        }
    }
    failures
}

/// Brings up the loopback interface.
pub fn net_init(syscall: &dyn Syscall) {
    if let Err(e) = syscall.set_link_up(LOOPBACK) {
        log::warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use nix::errno::Errno;
    use std::fs;

    #[test]
    fn test_create_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let syscall = TestHelperSyscall::default();
        assert_eq!(create_rootfs(&syscall, dir.path()), 0);

        for path in ["etc", "tmp", "run", "proc", "sys", "dev/pts", "var/log"] {
            assert!(dir.path().join(path).is_dir(), "{} missing", path);
        }
        assert_eq!(
            fs::read_link(dir.path().join("dev/stdout")).unwrap(),
            PathBuf::from("/proc/self/fd/1")
        );

        let targets: Vec<PathBuf> = syscall
            .get_mount_args()
            .into_iter()
            .map(|m| m.target)
            .collect();
        let expected: Vec<PathBuf> = ["proc", "sys", "dev", "dev/pts", "tmp", "run"]
            .iter()
            .map(|p| dir.path().join(p))
            .collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_create_rootfs_twice() {
        let dir = tempfile::tempdir().unwrap();
        let syscall = TestHelperSyscall::default();
        assert_eq!(create_rootfs(&syscall, dir.path()), 0);
        assert_eq!(create_rootfs(&syscall, dir.path()), 0);
    }

    #[test]
    fn test_mount_failure_does_not_stop_setup() {
        let dir = tempfile::tempdir().unwrap();
        let syscall = TestHelperSyscall::default();
        syscall.fail_mount(dir.path().join("sys"), Errno::EPERM);

        assert_eq!(create_rootfs(&syscall, dir.path()), 1);
        assert_eq!(syscall.get_mount_args().len(), 6);
        assert!(fs::symlink_metadata(dir.path().join("dev/stderr")).is_ok());
    }

    #[test]
    fn test_net_init() {
        let syscall = TestHelperSyscall::default();
        net_init(&syscall);
        assert_eq!(syscall.get_link_up_args(), vec!["lo".to_string()]);
    }
}
