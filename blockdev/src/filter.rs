//! Narrowing filters over a set of block devices.
//!
//! Every filter returns a new set holding a subset of its input in the
//! original order. GUID filters read each device's partition table again on
//! every call.

use std::ops::Deref;

use crate::device::BlockDev;
use crate::gpt::Guid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevices(Vec<BlockDev>);

impl From<Vec<BlockDev>> for BlockDevices {
    fn from(devices: Vec<BlockDev>) -> Self {
        BlockDevices(devices)
    }
}

impl FromIterator<BlockDev> for BlockDevices {
    fn from_iter<I: IntoIterator<Item = BlockDev>>(iter: I) -> Self {
        BlockDevices(iter.into_iter().collect())
    }
}

impl IntoIterator for BlockDevices {
    type Item = BlockDev;
    type IntoIter = std::vec::IntoIter<BlockDev>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Deref for BlockDevices {
    type Target = [BlockDev];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl BlockDevices {
    fn retain_by<F: FnMut(&BlockDev) -> bool>(&self, mut keep: F) -> BlockDevices {
        self.0.iter().filter(|d| keep(d)).cloned().collect()
    }

    /// Keeps devices with at least one byte of backing storage.
    ///
    /// Loop, nbd and ram devices show up in `/sys/class/block` even when
    /// nothing is attached. A device whose size cannot be read is dropped.
    pub fn filter_zero_size(&self) -> BlockDevices {
        self.retain_by(|device| match device.size() {
            Ok(n) => n > 0,
            Err(e) => {
                log::debug!("dropping {}: {}", device.name(), e);
                false
            }
        })
    }

    /// Keeps devices whose partition table holds an EFI system partition.
    pub fn filter_esp(&self) -> BlockDevices {
        self.filter_guid(&Guid::ESP)
    }

    /// Keeps devices whose GPT has a partition of the given type.
    ///
    /// Devices without a readable GPT are skipped.
    pub fn filter_guid(&self, guid: &Guid) -> BlockDevices {
        self.retain_by(|device| match device.gpt_table() {
            Ok(table) => table.has_type(guid),
            Err(e) => {
                log::debug!("skipping; no GPT table on {}: {}", device.name(), e);
                false
            }
        })
    }

    pub fn filter_fs_uuid(&self, fs_uuid: &str) -> BlockDevices {
        self.retain_by(|device| device.fs_uuid() == Some(fs_uuid))
    }

    pub fn filter_name(&self, name: &str) -> BlockDevices {
        self.retain_by(|device| device.name() == name)
    }

    pub fn into_inner(self) -> Vec<BlockDev> {
        self.0
    }
}
