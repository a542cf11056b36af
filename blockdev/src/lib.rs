//! Block devices as seen from an initramfs: enumeration, GPT partition
//! tables, filesystem identity from superblock magic, and filters to pick
//! the device to boot from.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod device;
pub mod filter;
pub mod gpt;
pub mod mounts;
pub mod superblock;
#[cfg(test)]
mod test_utils;

pub use device::{BlockDev, BlockDeviceCatalog, DeviceError};
pub use filter::BlockDevices;
pub use gpt::Guid;
pub use mounts::mount_point_of;
pub use superblock::FsKind;
