//! Binding regular files to loop block devices.
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::{ioctl_none_bad, ioctl_write_int_bad};

pub type Result<T> = std::result::Result<T, LoopError>;

pub const DEFAULT_LOOP_CONTROL: &str = "/dev/loop-control";

// See linux/loop.h.
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("no free loop device via {control:?}")]
    NoFreeLoopDevice {
        control: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to attach {image:?} to {device:?}: {errno}")]
    AttachFailed {
        image: PathBuf,
        device: PathBuf,
        errno: Errno,
    },
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LoopControl {
    control: PathBuf,
    dev_root: PathBuf,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_CONTROL, "/dev")
    }
}

impl LoopControl {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(control: P, dev_root: Q) -> Self {
        Self {
            control: control.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Asks the kernel for the first unbound loop device.
    pub fn find_free(&self) -> Result<PathBuf> {
        let no_free = |source| LoopError::NoFreeLoopDevice {
            control: self.control.clone(),
            source,
        };
        let control = File::open(&self.control).map_err(no_free)?;
        let index = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
            .map_err(|errno| no_free(io::Error::from(errno)))?;
        Ok(self.device_path(index))
    }

    fn device_path(&self, index: i32) -> PathBuf {
        self.dev_root.join(format!("loop{}", index))
    }

    /// Binds `image` to a free loop device. Detaching is left to the caller.
    pub fn attach(&self, image: &Path) -> Result<PathBuf> {
        let device = self.find_free()?;
        let open_rw = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|source| LoopError::Open {
                    path: path.to_path_buf(),
                    source,
                })
        };

        let image_file = open_rw(image)?;
        let loop_file = open_rw(&device)?;
        unsafe { loop_set_fd(loop_file.as_raw_fd(), image_file.as_raw_fd()) }.map_err(|errno| {
            LoopError::AttachFailed {
                image: image.to_path_buf(),
                device: device.clone(),
                errno,
            }
        })?;

        log::debug!("attached {:?} to {:?}", image, device);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_loop_control() {
        let dir = tempfile::tempdir().unwrap();
        let control = LoopControl::new(dir.path().join("loop-control"), dir.path());
        let err = control.attach(Path::new("/rootfs_tmp/root.sqfs")).unwrap_err();
        assert!(matches!(err, LoopError::NoFreeLoopDevice { .. }));
    }

    #[test]
    fn test_loop_control_not_a_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop-control");
        fs::write(&path, b"").unwrap();
        let control = LoopControl::new(&path, dir.path());
        assert!(matches!(
            control.find_free(),
            Err(LoopError::NoFreeLoopDevice { .. })
        ));
    }

    #[test]
    fn test_device_path() {
        let control = LoopControl::default();
        assert_eq!(control.device_path(3), PathBuf::from("/dev/loop3"));
    }
}
