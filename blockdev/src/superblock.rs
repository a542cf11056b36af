//! Filesystem identification from fixed superblock offsets.
//!
//! Only the magic number and the UUID field are ever read. The filesystem
//! contents are never interpreted.
//! See https://www.nongnu.org/ext2-doc/ext2.html#DISK-ORGANISATION for ext4 and
//! https://de.wikipedia.org/wiki/File_Allocation_Table#Aufbau for FAT32.

use std::fmt::{self, Display};
use std::io::{self, Read, Seek, SeekFrom};

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{0} magic not found")]
    UnrecognizedFilesystem(FsKind),
    #[error("unknown UUID (not vfat, ext4, nor xfs)")]
    NoKnownFilesystem,
    #[error("failed to read {kind} superblock at offset {offset}")]
    Io {
        kind: FsKind,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    Vfat,
    Ext4,
    Xfs,
}

impl Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print = match *self {
            FsKind::Vfat => "vfat",
            FsKind::Ext4 => "ext4",
            FsKind::Xfs => "xfs",
        };

        write!(f, "{}", print)
    }
}

/// Location of the magic number and UUID for one filesystem kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockSignature {
    pub kind: FsKind,
    pub magic_offset: u64,
    pub magic: &'static [u8],
    pub uuid_offset: u64,
    pub uuid_len: usize,
}

// Offset of the ext2/3/4 superblock in the partition.
const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC: [u8; 2] = 0xEF53u16.to_le_bytes();

/// Probe order. The first signature whose magic matches wins.
pub static SIGNATURES: [SuperblockSignature; 3] = [
    SuperblockSignature {
        kind: FsKind::Vfat,
        magic_offset: 82,
        magic: b"FAT32   ",
        // Volume serial number, used as the short filesystem UUID.
        uuid_offset: 67,
        uuid_len: 4,
    },
    SuperblockSignature {
        kind: FsKind::Ext4,
        magic_offset: EXT_SUPERBLOCK_OFFSET + 56,
        magic: &EXT_MAGIC,
        uuid_offset: EXT_SUPERBLOCK_OFFSET + 104,
        uuid_len: 16,
    },
    SuperblockSignature {
        kind: FsKind::Xfs,
        magic_offset: 0,
        magic: b"XFSB",
        uuid_offset: 32,
        uuid_len: 16,
    },
];

impl SuperblockSignature {
    pub fn for_kind(kind: FsKind) -> &'static SuperblockSignature {
        SIGNATURES
            .iter()
            .find(|s| s.kind == kind)
            .unwrap_or(&SIGNATURES[0])
    }

    /// Checks the magic and, on a match, reads and formats the UUID.
    pub fn probe<R: Read + Seek>(&self, dev: &mut R) -> Result<String> {
        let magic = self.read_at(dev, self.magic_offset, self.magic.len())?;
        if magic != self.magic {
            return Err(ProbeError::UnrecognizedFilesystem(self.kind));
        }

        let uuid = self.read_at(dev, self.uuid_offset, self.uuid_len)?;
        Ok(match self.kind {
            FsKind::Vfat => format_serial(&uuid),
            FsKind::Ext4 | FsKind::Xfs => format_uuid(&uuid),
        })
    }

    fn read_at<R: Read + Seek>(&self, dev: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
        let io_err = |source| ProbeError::Io {
            kind: self.kind,
            offset,
            source,
        };
        dev.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let mut buf = vec![0u8; len];
        dev.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }
}

/// Tries every known filesystem in order and returns the first match.
///
/// A failed attempt, whether a magic mismatch or a short read, only ends that
/// attempt. `NoKnownFilesystem` means no identity is available.
pub fn probe<R: Read + Seek>(dev: &mut R) -> Result<(FsKind, String)> {
    for signature in &SIGNATURES {
        match signature.probe(dev) {
            Ok(uuid) => return Ok((signature.kind, uuid)),
            Err(e) => log::trace!("{}", e),
        }
    }

    Err(ProbeError::NoKnownFilesystem)
}

// FAT stores the serial little endian; it is displayed most significant byte first.
fn format_serial(b: &[u8]) -> String {
    format!("{:02x}{:02x}-{:02x}{:02x}", b[3], b[2], b[1], b[0])
}

fn format_uuid(b: &[u8]) -> String {
    match Uuid::from_slice(b) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const UUID_BYTES: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10,
    ];

    fn image(len: usize, patches: &[(usize, &[u8])]) -> Cursor<Vec<u8>> {
        let mut buf = vec![0u8; len];
        for (offset, bytes) in patches {
            buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }
        Cursor::new(buf)
    }

    #[test]
    fn test_ext4_uuid() {
        let mut dev = image(4096, &[(1080, &[0x53, 0xef]), (1128, &UUID_BYTES)]);
        let (kind, uuid) = probe(&mut dev).expect("ext4 should be detected");
        assert_eq!(kind, FsKind::Ext4);
        assert_eq!(uuid, "01020304-0506-0708-090a-0b0c0d0e0f10");
    }

    #[test]
    fn test_vfat_serial_is_reversed() {
        let mut dev = image(512, &[(82, b"FAT32   "), (67, &[0xdd, 0xcc, 0xbb, 0xaa])]);
        let (kind, uuid) = probe(&mut dev).expect("vfat should be detected");
        assert_eq!(kind, FsKind::Vfat);
        assert_eq!(uuid, "aabb-ccdd");
    }

    #[test]
    fn test_xfs_uuid() {
        let mut dev = image(512, &[(0, b"XFSB"), (32, &UUID_BYTES)]);
        let (kind, uuid) = probe(&mut dev).expect("xfs should be detected");
        assert_eq!(kind, FsKind::Xfs);
        assert_eq!(uuid, "01020304-0506-0708-090a-0b0c0d0e0f10");
    }

    #[test]
    fn test_vfat_takes_priority_over_xfs() {
        let mut dev = image(
            512,
            &[
                (0, b"XFSB"),
                (32, &UUID_BYTES),
                (82, b"FAT32   "),
                (67, &[0x04, 0x03, 0x02, 0x01]),
            ],
        );
        let (kind, uuid) = probe(&mut dev).unwrap();
        assert_eq!(kind, FsKind::Vfat);
        assert_eq!(uuid, "0102-0304");
    }

    #[test]
    fn test_no_known_filesystem() {
        let mut dev = image(4096, &[]);
        assert!(matches!(
            probe(&mut dev),
            Err(ProbeError::NoKnownFilesystem)
        ));
    }

    #[test]
    fn test_short_device_fails_only_the_ext4_attempt() {
        // Too short for the ext4 superblock, but the xfs magic at 0 still matches.
        let mut dev = image(64, &[(0, b"XFSB"), (32, &UUID_BYTES)]);
        let ext4 = SuperblockSignature::for_kind(FsKind::Ext4);
        assert!(matches!(
            ext4.probe(&mut dev),
            Err(ProbeError::Io {
                kind: FsKind::Ext4,
                ..
            })
        ));
        assert_eq!(probe(&mut dev).unwrap().0, FsKind::Xfs);
    }

    #[test]
    fn test_magic_mismatch_is_unrecognized() {
        let mut dev = image(512, &[(82, b"FAT16   ")]);
        let vfat = SuperblockSignature::for_kind(FsKind::Vfat);
        assert!(matches!(
            vfat.probe(&mut dev),
            Err(ProbeError::UnrecognizedFilesystem(FsKind::Vfat))
        ));
    }

    #[test]
    fn test_empty_device() {
        let mut dev = Cursor::new(Vec::new());
        assert!(matches!(
            probe(&mut dev),
            Err(ProbeError::NoKnownFilesystem)
        ));
    }
}
