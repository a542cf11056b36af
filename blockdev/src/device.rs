//! Block device discovery and per-device queries.
//!
//! Every query opens the device node, issues its ioctl or read, and drops the
//! descriptor before returning. Nothing is held open between calls.

use std::fmt::{self, Display};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc::{c_int, size_t};
use nix::{ioctl_none, ioctl_read_bad, request_code_none, request_code_read};

use crate::filter::BlockDevices;
use crate::gpt::{self, GptError, Table};
use crate::superblock::{self, FsKind};

pub type Result<T> = std::result::Result<T, DeviceError>;

pub const DEFAULT_SYS_CLASS_BLOCK: &str = "/sys/class/block";
pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// Sector size assumed for regular image files, which have no block ioctls.
pub const IMAGE_SECTOR_SIZE: u64 = 512;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to read block device namespace {path:?}")]
    Namespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("block device {name} not found")]
    NotFound {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid block device path {0:?}")]
    InvalidName(PathBuf),
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ioctl({op}) on {path:?} failed: {errno}")]
    Ioctl {
        op: &'static str,
        path: PathBuf,
        errno: Errno,
    },
    #[error(transparent)]
    Gpt(#[from] GptError),
    #[error("mountpoint not found for {0}")]
    MountPointNotFound(String),
    #[error("failed to read the mount table")]
    Proc(#[from] procfs::ProcError),
}

impl DeviceError {
    pub fn is_no_gpt_table(&self) -> bool {
        matches!(self, DeviceError::Gpt(GptError::NoGptTable(_)))
    }
}

// See linux/fs.h. BLKBSZGET and BLKGETSIZE64 are declared with a size_t
// argument; the kernel writes an int and a u64 respectively.
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
ioctl_read_bad!(blkpbszget, request_code_none!(0x12, 123), c_int);
ioctl_read_bad!(
    blkbszget,
    request_code_read!(0x12, 112, std::mem::size_of::<size_t>()),
    c_int
);
ioctl_read_bad!(
    blkgetsize64,
    request_code_read!(0x12, 114, std::mem::size_of::<size_t>()),
    u64
);
ioctl_none!(blkrrpart, 0x12, 95);

/// A block device as seen during one enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDev {
    name: String,
    fs_type: Option<FsKind>,
    fs_uuid: Option<String>,
    node: PathBuf,
}

impl Display for BlockDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = self.fs_uuid.as_deref().unwrap_or("");
        match self.fs_type {
            Some(kind) => write!(
                f,
                "BlockDevice(name={}, fs_type={}, fs_uuid={})",
                self.name, kind, uuid
            ),
            None => write!(f, "BlockDevice(name={}, fs_uuid={})", self.name, uuid),
        }
    }
}

impl BlockDev {
    /// Builds a device entry for the node at `node`, probing its superblock.
    ///
    /// A probe failure leaves the filesystem identity empty.
    pub fn probe(name: impl Into<String>, node: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let node = node.into();
        let identity = File::open(&node)
            .map_err(|e| log::debug!("could not open {:?} to probe it: {}", node, e))
            .ok()
            .and_then(|mut file| match superblock::probe(&mut file) {
                Ok(found) => Some(found),
                Err(e) => {
                    log::debug!("no filesystem identity for {}: {}", name, e);
                    None
                }
            });

        let (fs_type, fs_uuid) = match identity {
            Some((kind, uuid)) => (Some(kind), Some(uuid)),
            None => (None, None),
        };

        BlockDev {
            name,
            fs_type,
            fs_uuid,
            node,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_type(&self) -> Option<FsKind> {
        self.fs_type
    }

    pub fn fs_uuid(&self) -> Option<&str> {
        self.fs_uuid.as_deref()
    }

    /// Path to the device node, `/dev/<name>` on a live system.
    pub fn device_path(&self) -> &Path {
        &self.node
    }

    fn open(&self) -> Result<File> {
        File::open(&self.node).map_err(|source| DeviceError::Open {
            path: self.node.clone(),
            source,
        })
    }

    fn is_image(file: &File) -> bool {
        file.metadata().map(|m| m.is_file()).unwrap_or(false)
    }

    fn ioctl_err(&self, op: &'static str) -> impl FnOnce(Errno) -> DeviceError + '_ {
        move |errno| DeviceError::Ioctl {
            op,
            path: self.node.clone(),
            errno,
        }
    }

    fn int_query(
        &self,
        op: &'static str,
        query: unsafe fn(c_int, *mut c_int) -> nix::Result<c_int>,
    ) -> Result<u64> {
        let file = self.open()?;
        if Self::is_image(&file) {
            return Ok(IMAGE_SECTOR_SIZE);
        }

        let mut value: c_int = 0;
        unsafe { query(file.as_raw_fd(), &mut value) }.map_err(self.ioctl_err(op))?;
        Ok(value as u64)
    }

    /// Logical block size (BLKSSZGET).
    pub fn block_size(&self) -> Result<u64> {
        self.int_query("BLKSSZGET", blksszget)
    }

    /// Physical block size (BLKPBSZGET).
    pub fn physical_block_size(&self) -> Result<u64> {
        self.int_query("BLKPBSZGET", blkpbszget)
    }

    /// Soft block size used inside the kernel (BLKBSZGET).
    pub fn kernel_block_size(&self) -> Result<u64> {
        self.int_query("BLKBSZGET", blkbszget)
    }

    /// Size in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.open()?;
        if Self::is_image(&file) {
            return file
                .metadata()
                .map(|m| m.len())
                .map_err(|source| DeviceError::Open {
                    path: self.node.clone(),
                    source,
                });
        }

        let mut size: u64 = 0;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
            .map_err(self.ioctl_err("BLKGETSIZE64"))?;
        Ok(size)
    }

    /// Asks the kernel to re-read the partition table of this device.
    pub fn read_partition_table(&self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.node)
            .map_err(|source| DeviceError::Open {
                path: self.node.clone(),
                source,
            })?;
        unsafe { blkrrpart(file.as_raw_fd()) }.map_err(self.ioctl_err("BLKRRPART"))?;
        Ok(())
    }

    /// Reads the GPT from the device.
    ///
    /// Returns `DeviceError::Gpt(GptError::NoGptTable)` when the device has no
    /// valid table.
    pub fn gpt_table(&self) -> Result<Table> {
        let block_size = self.block_size()?;
        let mut file = self.open()?;
        Ok(gpt::read_table(&mut file, block_size)?)
    }
}

/// Enumerates the block devices the kernel exposes under `/sys/class/block`.
#[derive(Debug, Clone)]
pub struct BlockDeviceCatalog {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for BlockDeviceCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_SYS_CLASS_BLOCK, DEFAULT_DEV_ROOT)
    }
}

impl BlockDeviceCatalog {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(sys_root: P, dev_root: Q) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Returns one entry per device in name order.
    ///
    /// Failing to read the namespace itself is an error; a device without a
    /// recognizable filesystem is not.
    pub fn discover(&self) -> Result<BlockDevices> {
        let namespace_err = |source| DeviceError::Namespace {
            path: self.sys_root.clone(),
            source,
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.sys_root).map_err(namespace_err)? {
            let entry = entry.map_err(namespace_err)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let devices = names
            .iter()
            .map(|name| self.device(name))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("discovered {} block devices", devices.len());
        Ok(devices.into())
    }

    /// Looks up one device. `maybe_devpath` may be `sda1`, `/dev/sda1` or
    /// `/sys/class/block/sda1`; only the last component is used.
    pub fn device<P: AsRef<Path>>(&self, maybe_devpath: P) -> Result<BlockDev> {
        let maybe_devpath = maybe_devpath.as_ref();
        let name = maybe_devpath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DeviceError::InvalidName(maybe_devpath.to_path_buf()))?;

        fs::metadata(self.sys_root.join(&name)).map_err(|source| DeviceError::NotFound {
            name: name.clone(),
            source,
        })?;

        let node = self.dev_root.join(&name);
        Ok(BlockDev::probe(name, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::{test_image, Guid};
    use crate::test_utils::{ext4_image, Fixture};

    #[test]
    fn test_discover_in_name_order() -> Result<()> {
        let fixture = Fixture::new();
        fixture.add("vdb", &[0u8; 4096]);
        fixture.add("loop0", &[]);
        fixture.add("vda", &ext4_image());

        let devices = fixture.catalog.discover()?;
        let names: Vec<&str> = devices.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["loop0", "vda", "vdb"]);

        assert_eq!(devices[0].fs_uuid(), None);
        assert_eq!(devices[1].fs_type(), Some(FsKind::Ext4));
        assert_eq!(
            devices[1].fs_uuid(),
            Some("11111111-1111-1111-1111-111111111111")
        );
        assert_eq!(devices[2].fs_uuid(), None);
        Ok(())
    }

    #[test]
    fn test_discover_missing_namespace_is_an_error() {
        let fixture = Fixture::new();
        let catalog = BlockDeviceCatalog::new(fixture.dir.path().join("nope"), "/dev");
        assert!(matches!(
            catalog.discover(),
            Err(DeviceError::Namespace { .. })
        ));
    }

    #[test]
    fn test_device_name_normalization() -> Result<()> {
        let fixture = Fixture::new();
        fixture.add("sda1", &ext4_image());

        for path in ["sda1", "/dev/sda1", "/sys/class/block/sda1"] {
            let dev = fixture.catalog.device(path)?;
            assert_eq!(dev.name(), "sda1");
            assert_eq!(dev.device_path(), fixture.dir.path().join("dev/sda1"));
        }
        Ok(())
    }

    #[test]
    fn test_unknown_device() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.catalog.device("sdz"),
            Err(DeviceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_device_without_node_has_no_identity() -> Result<()> {
        let fixture = Fixture::new();
        fs::create_dir(fixture.dir.path().join("sys/ram0")).unwrap();
        let dev = fixture.catalog.device("ram0")?;
        assert_eq!(dev.fs_uuid(), None);
        assert!(dev.size().is_err());
        Ok(())
    }

    #[test]
    fn test_display() {
        let fixture = Fixture::new();
        fixture.add("vda", &ext4_image());
        fixture.add("vdb", &[]);
        let vda = fixture.catalog.device("vda").unwrap();
        let vdb = fixture.catalog.device("vdb").unwrap();
        assert_eq!(
            vda.to_string(),
            "BlockDevice(name=vda, fs_type=ext4, fs_uuid=11111111-1111-1111-1111-111111111111)"
        );
        assert_eq!(vdb.to_string(), "BlockDevice(name=vdb, fs_uuid=)");
    }

    #[test]
    fn test_image_queries() -> Result<()> {
        let fixture = Fixture::new();
        let img = test_image::build(512, &[Guid::ESP]);
        fixture.add("vdc", &img);
        let dev = fixture.catalog.device("vdc")?;

        assert_eq!(dev.size()?, img.len() as u64);
        assert_eq!(dev.block_size()?, IMAGE_SECTOR_SIZE);
        assert!(dev.gpt_table()?.has_type(&Guid::ESP));
        Ok(())
    }

    #[test]
    fn test_gpt_table_missing() {
        let fixture = Fixture::new();
        fixture.add("vdd", &[0u8; 8192]);
        let dev = fixture.catalog.device("vdd").unwrap();
        let err = dev.gpt_table().unwrap_err();
        assert!(err.is_no_gpt_table());
    }
}
