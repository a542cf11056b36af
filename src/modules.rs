//! Loading the kernel modules shipped in the initramfs.
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::syscall::Syscall;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("failed to load {} module(s): {}", .0.len(), names(.0))]
    Unloaded(Vec<(PathBuf, String)>),
}

fn names(failed: &[(PathBuf, String)]) -> String {
    failed
        .iter()
        .map(|(path, reason)| format!("{} ({})", path.display(), reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// All `*.ko` files under `dir`, sorted by path. Symlinks are not followed;
/// unreadable entries are logged and skipped.
pub fn find_modules(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("skipping module entry: {}", e);
                None
            }
        })
        .filter(|entry| {
            !entry.file_type().is_dir() && entry.path().extension().map_or(false, |ext| ext == "ko")
        })
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

/// Loads every module under `dir`. Modules that fail are retried in further
/// passes for as long as a pass loads something, so dependencies may come in
/// any order. Returns the number of modules loaded.
///
/// A missing `dir` means there is nothing to load.
pub fn install_all(syscall: &dyn Syscall, dir: &Path) -> Result<usize, ModuleError> {
    if !dir.exists() {
        log::debug!("no modules to load: {:?} does not exist", dir);
        return Ok(0);
    }

    let mut pending = find_modules(dir);
    let mut loaded = 0;
    loop {
        let attempted = pending.len();
        let mut failed = Vec::new();
        for module in pending.drain(..) {
            match syscall.load_module(&module) {
                Ok(()) => {
                    log::debug!("loaded module {:?}", module);
                    loaded += 1;
                }
                Err(e) => failed.push((module, e.to_string())),
            }
        }

        if failed.is_empty() {
            return Ok(loaded);
        }
        if failed.len() == attempted {
            return Err(ModuleError::Unloaded(failed));
        }
        pending = failed.into_iter().map(|(module, _)| module).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use nix::errno::Errno;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn module_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("kernel/net")).unwrap();
        for name in ["a.ko", "b.ko", "README", "kernel/net/c.ko", "kernel/d.ko.xz"] {
            fs::write(dir.path().join(name), b"\x7fELF").unwrap();
        }
        dir
    }

    #[test]
    fn test_find_modules() {
        let dir = module_tree();
        let found = find_modules(dir.path());
        assert_eq!(
            found,
            vec![
                dir.path().join("a.ko"),
                dir.path().join("b.ko"),
                dir.path().join("kernel/net/c.ko"),
            ]
        );
    }

    #[test]
    fn test_symlink_loop_is_not_followed() {
        let dir = module_tree();
        symlink("..", dir.path().join("kernel/net/loop")).unwrap();
        symlink("/nonexistent/build", dir.path().join("build")).unwrap();
        symlink(dir.path().join("a.ko"), dir.path().join("kernel/alias.ko")).unwrap();

        let found = find_modules(dir.path());
        assert_eq!(
            found,
            vec![
                dir.path().join("a.ko"),
                dir.path().join("b.ko"),
                dir.path().join("kernel/alias.ko"),
                dir.path().join("kernel/net/c.ko"),
            ]
        );
    }

    #[test]
    fn test_missing_dir_loads_nothing() {
        let syscall = TestHelperSyscall::default();
        let loaded = install_all(&syscall, Path::new("/nonexistent/lib/modules")).unwrap();
        assert_eq!(loaded, 0);
        assert!(syscall.get_load_module_args().is_empty());
    }

    #[test]
    fn test_dependencies_resolve_over_passes() {
        let dir = module_tree();
        let syscall = TestHelperSyscall::default();
        // a.ko depends on c.ko, which sorts after it.
        syscall.fail_module(dir.path().join("a.ko"), 1, Errno::ENOENT);

        assert_eq!(install_all(&syscall, dir.path()).unwrap(), 3);
        assert_eq!(
            syscall.get_load_module_args(),
            vec![
                dir.path().join("a.ko"),
                dir.path().join("b.ko"),
                dir.path().join("kernel/net/c.ko"),
                dir.path().join("a.ko"),
            ]
        );
    }

    #[test]
    fn test_permanent_failure_is_reported() {
        let dir = module_tree();
        let syscall = TestHelperSyscall::default();
        syscall.fail_module(dir.path().join("b.ko"), usize::MAX, Errno::EINVAL);

        let err = install_all(&syscall, dir.path()).unwrap_err();
        match err {
            ModuleError::Unloaded(failed) => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, dir.path().join("b.ko"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // One pass with progress, one retry without.
        assert_eq!(syscall.get_load_module_args().len(), 4);
    }
}
