//! GUID Partition Table parsing.
//!
//! The primary header lives at logical block 1. Its partition entry array is
//! located through the header and checked against the header's CRC32.
//! Nothing here is cached: callers read a fresh table on every query.

use std::fmt::{self, Display};
use std::io::{self, Read, Seek, SeekFrom};
use std::str::FromStr;

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GptError>;

#[derive(Debug, thiserror::Error)]
pub enum GptError {
    #[error("no GPT table: {0}")]
    NoGptTable(String),
    #[error("failed to read GPT")]
    Io(#[from] io::Error),
}

pub const SIGNATURE: &[u8; 8] = b"EFI PART";
pub const MIN_HEADER_SIZE: u32 = 92;
pub const DEFAULT_ENTRY_SIZE: u32 = 128;
// Sanity caps on the entry array; the UEFI minimum is 128 entries.
const MAX_ENTRIES: u32 = 4096;
const MAX_ENTRY_ARRAY_BYTES: u64 = 1024 * 1024;
const HYPHENATED_LEN: usize = 36;

/// A GUID in its on-disk mixed-endian layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const ZERO: Guid = Guid([0; 16]);

    /// EFI System Partition, C12A7328-F81F-11D2-BA4B-00A0C93EC93B.
    pub const ESP: Guid = Guid([
        0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9,
        0x3b,
    ]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Guid::ZERO
    }

    fn uuid(&self) -> Uuid {
        Uuid::from_bytes_le(self.0)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.uuid().hyphenated())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid GUID {0:?}")]
pub struct ParseGuidError(String);

impl FromStr for Guid {
    type Err = ParseGuidError;

    /// Accepts the hyphenated form only, in either case.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != HYPHENATED_LEN {
            return Err(ParseGuidError(s.to_owned()));
        }
        let uuid = Uuid::parse_str(s).map_err(|_| ParseGuidError(s.to_owned()))?;
        Ok(Guid(uuid.to_bytes_le()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub revision: u32,
    pub header_size: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based slot in the entry array.
    pub index: u32,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub block_size: u64,
    pub header: Header,
    /// Used entries only, in slot order.
    pub partitions: Vec<Partition>,
}

impl Header {
    /// Size in bytes of the partition entry array.
    pub fn entry_array_len(&self) -> u64 {
        u64::from(self.num_entries) * u64::from(self.entry_size)
    }
}

impl Table {
    pub fn has_type(&self, guid: &Guid) -> bool {
        self.partitions.iter().any(|p| p.type_guid == *guid)
    }
}

/// Reads the primary GPT of a device whose logical block size is `block_size`.
pub fn read_table<R: Read + Seek>(dev: &mut R, block_size: u64) -> Result<Table> {
    if block_size < u64::from(MIN_HEADER_SIZE) {
        return Err(GptError::NoGptTable(format!(
            "block size {} is too small",
            block_size
        )));
    }

    dev.seek(SeekFrom::Start(block_size))?;
    let mut block = vec![0u8; block_size as usize];
    read_exact_or_missing(dev, &mut block, "header")?;

    let header = parse_header(&block, block_size)?;

    let offset = header.entries_lba.checked_mul(block_size).ok_or_else(|| {
        GptError::NoGptTable(format!(
            "entry array LBA {} is out of range",
            header.entries_lba
        ))
    })?;
    dev.seek(SeekFrom::Start(offset))?;
    let mut entries = vec![0u8; header.entry_array_len() as usize];
    read_exact_or_missing(dev, &mut entries, "partition entries")?;

    let expected = le_u32(&block, 88);
    if crc32fast::hash(&entries) != expected {
        return Err(GptError::NoGptTable(
            "partition entry array checksum mismatch".to_owned(),
        ));
    }

    let partitions = entries
        .chunks_exact(header.entry_size as usize)
        .enumerate()
        .map(|(i, raw)| parse_entry(i as u32 + 1, raw))
        .filter(|p| !p.type_guid.is_zero())
        .collect();

    Ok(Table {
        block_size,
        header,
        partitions,
    })
}

fn read_exact_or_missing<R: Read>(dev: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match dev.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(GptError::NoGptTable(format!(
            "device too short to hold the {}",
            what
        ))),
        Err(e) => Err(e.into()),
    }
}

fn parse_header(block: &[u8], block_size: u64) -> Result<Header> {
    if &block[0..8] != SIGNATURE {
        return Err(GptError::NoGptTable("signature not found".to_owned()));
    }

    let header_size = le_u32(block, 12);
    if header_size < MIN_HEADER_SIZE || u64::from(header_size) > block_size {
        return Err(GptError::NoGptTable(format!(
            "invalid header size {}",
            header_size
        )));
    }

    let mut raw = block[..header_size as usize].to_vec();
    raw[16..20].fill(0);
    if crc32fast::hash(&raw) != le_u32(block, 16) {
        return Err(GptError::NoGptTable("header checksum mismatch".to_owned()));
    }

    let num_entries = le_u32(block, 80);
    let entry_size = le_u32(block, 84);
    let array_len = u64::from(num_entries) * u64::from(entry_size);
    if entry_size < DEFAULT_ENTRY_SIZE
        || entry_size % 8 != 0
        || num_entries > MAX_ENTRIES
        || array_len > MAX_ENTRY_ARRAY_BYTES
    {
        return Err(GptError::NoGptTable(format!(
            "unsupported entry array ({} entries of {} bytes)",
            num_entries, entry_size
        )));
    }

    Ok(Header {
        revision: le_u32(block, 8),
        header_size,
        current_lba: le_u64(block, 24),
        backup_lba: le_u64(block, 32),
        first_usable_lba: le_u64(block, 40),
        last_usable_lba: le_u64(block, 48),
        disk_guid: guid_at(block, 56),
        entries_lba: le_u64(block, 72),
        num_entries,
        entry_size,
    })
}

fn parse_entry(index: u32, raw: &[u8]) -> Partition {
    let name: Vec<u16> = raw[56..128]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();

    Partition {
        index,
        type_guid: guid_at(raw, 0),
        unique_guid: guid_at(raw, 16),
        first_lba: le_u64(raw, 32),
        last_lba: le_u64(raw, 40),
        attributes: le_u64(raw, 48),
        name: String::from_utf16_lossy(&name),
    }
}

fn guid_at(b: &[u8], off: usize) -> Guid {
    let mut g = [0u8; 16];
    g.copy_from_slice(&b[off..off + 16]);
    Guid(g)
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    let mut x = [0u8; 4];
    x.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(x)
}

fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut x = [0u8; 8];
    x.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(x)
}
