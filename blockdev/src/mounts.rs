use std::path::{Path, PathBuf};

use procfs::process::{MountInfo, Process};

use crate::device::{DeviceError, Result};

/// Returns where `device` is mounted, according to the current mount table.
pub fn mount_point_of<P: AsRef<Path>>(device: P) -> Result<PathBuf> {
    let mount_infos = Process::myself()?.mountinfo()?;
    find_mount_point(device.as_ref(), &mount_infos).map(Path::to_path_buf)
}

/// First mount whose source is `device`. Later mounts of the same device are
/// bind mounts or stacked mounts and are ignored.
pub fn find_mount_point<'a>(device: &Path, mount_infos: &'a [MountInfo]) -> Result<&'a Path> {
    mount_infos
        .iter()
        .find(|mi| mi.mount_source.as_deref().map(Path::new) == Some(device))
        .map(|mi| mi.mount_point.as_path())
        .ok_or_else(|| DeviceError::MountPointNotFound(device.display().to_string()))
}

/// Reads the mount table of the calling process.
pub fn mount_table() -> Result<Vec<MountInfo>> {
    Ok(Process::myself()?.mountinfo()?)
}
