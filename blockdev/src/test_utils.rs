//! Fake `/sys/class/block` and `/dev` trees backed by image files.

use std::fs;

use tempfile::TempDir;

use crate::device::BlockDeviceCatalog;

pub struct Fixture {
    pub dir: TempDir,
    pub catalog: BlockDeviceCatalog,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::create_dir(dir.path().join("sys")).expect("create sys dir");
        fs::create_dir(dir.path().join("dev")).expect("create dev dir");
        let catalog = BlockDeviceCatalog::new(dir.path().join("sys"), dir.path().join("dev"));
        Fixture { dir, catalog }
    }

    pub fn add(&self, name: &str, contents: &[u8]) {
        fs::create_dir(self.dir.path().join("sys").join(name)).expect("create sys entry");
        fs::write(self.dir.path().join("dev").join(name), contents).expect("write device image");
    }
}

/// 4 KiB image with an ext4 magic and a UUID of all 0x11 bytes.
pub fn ext4_image() -> Vec<u8> {
    let mut img = vec![0u8; 4096];
    img[1080..1082].copy_from_slice(&[0x53, 0xef]);
    img[1128..1144].copy_from_slice(&[0x11; 16]);
    img
}
