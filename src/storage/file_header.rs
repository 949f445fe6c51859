//! Database file header.
//!
//! The header occupies a fixed prefix of the file, ahead of position 0 of
//! the page area. It carries settings fixed at creation time plus the id of
//! the last page checkpointed into the data area.

use crate::error::{Result, StorageError};
use crate::index::Collation;
use crate::types::{PageId, PAGE_SIZE};
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes to identify a valid database file
pub const MAGIC: &[u8; 16] = b"DocStorage v1\0\0\0";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// File header size (the page area starts right after it)
pub const FILE_HEADER_SIZE: usize = PAGE_SIZE;

const MAX_CULTURE_LEN: usize = 32;
const CHECKSUM_OFFSET: usize = 107;

/// Database file header
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       16    Magic string "DocStorage v1"
/// 16      4     Format version
/// 20      4     Page size (always 8192)
/// 24      1     Encryption flag
/// 25      16    Encryption salt
/// 41      1     Collation: ignore case
/// 42      1     Collation: culture name length
/// 43      32    Collation: culture name (UTF-8)
/// 75      8     Creation time (unix milliseconds)
/// 83      16    Instance id
/// 99      4     Last page id in the data area
/// 103     4     Highest transaction id folded in by a checkpoint
/// 107     4     Checksum of header (CRC32)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u32,
    pub encrypted: bool,
    pub salt: [u8; 16],
    pub collation: Collation,
    pub creation_time: i64,
    pub instance_id: [u8; 16],
    /// Highest page id written to its home position
    pub last_page_id: PageId,
    /// Log pages of this transaction id or lower are already checkpointed
    pub checkpoint_tx_id: u32,
}

impl FileHeader {
    /// Create a header for a new database
    pub fn new(collation: Collation) -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; 16];
        let mut instance_id = [0u8; 16];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut instance_id);

        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Self {
            format_version: FORMAT_VERSION,
            encrypted: false,
            salt,
            collation,
            creation_time,
            instance_id,
            last_page_id: PageId::new(0),
            checkpoint_tx_id: 0,
        }
    }

    /// Read a file header from bytes
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHECKSUM_OFFSET + 4 {
            return Err(StorageError::invalid_db("header too short"));
        }

        if &bytes[0..16] != MAGIC {
            return Err(StorageError::invalid_db("invalid magic bytes"));
        }

        let u32_at =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let stored_checksum = u32_at(CHECKSUM_OFFSET);
        let computed_checksum = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::corruption("header checksum mismatch"));
        }

        let format_version = u32_at(16);
        if format_version != FORMAT_VERSION {
            return Err(StorageError::invalid_db(format!(
                "unsupported format version: {}",
                format_version
            )));
        }

        let page_size = u32_at(20);
        if page_size != PAGE_SIZE as u32 {
            return Err(StorageError::invalid_db(format!(
                "unsupported page size: {} (expected {})",
                page_size, PAGE_SIZE
            )));
        }

        let mut salt = [0u8; 16];
        salt.copy_from_slice(&bytes[25..41]);

        let culture_len = (bytes[42] as usize).min(MAX_CULTURE_LEN);
        let culture = std::str::from_utf8(&bytes[43..43 + culture_len])
            .map_err(|_| StorageError::invalid_db("collation culture is not UTF-8"))?
            .to_string();

        let mut creation = [0u8; 8];
        creation.copy_from_slice(&bytes[75..83]);
        let mut instance_id = [0u8; 16];
        instance_id.copy_from_slice(&bytes[83..99]);

        Ok(Self {
            format_version,
            encrypted: bytes[24] != 0,
            salt,
            collation: Collation {
                culture,
                ignore_case: bytes[41] != 0,
            },
            creation_time: i64::from_be_bytes(creation),
            instance_id,
            last_page_id: PageId::new(u32_at(99)),
            checkpoint_tx_id: u32_at(103),
        })
    }

    /// Write this header to bytes
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..FILE_HEADER_SIZE].fill(0);

        bytes[0..16].copy_from_slice(MAGIC);
        bytes[16..20].copy_from_slice(&self.format_version.to_be_bytes());
        bytes[20..24].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());
        bytes[24] = self.encrypted as u8;
        bytes[25..41].copy_from_slice(&self.salt);
        bytes[41] = self.collation.ignore_case as u8;

        let culture = truncate_utf8(&self.collation.culture, MAX_CULTURE_LEN);
        bytes[42] = culture.len() as u8;
        bytes[43..43 + culture.len()].copy_from_slice(culture.as_bytes());

        bytes[75..83].copy_from_slice(&self.creation_time.to_be_bytes());
        bytes[83..99].copy_from_slice(&self.instance_id);
        bytes[99..103].copy_from_slice(&self.last_page_id.value().to_be_bytes());
        bytes[103..107].copy_from_slice(&self.checkpoint_tx_id.to_be_bytes());

        let checksum = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = FileHeader::new(Collation::binary());
        header.last_page_id = PageId::new(77);
        header.checkpoint_tx_id = 12;

        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut bytes);

        let restored = FileHeader::read(&bytes).unwrap();
        assert_eq!(restored, header);
        assert!(!restored.collation.ignore_case);
    }

    #[test]
    fn test_instances_differ() {
        let a = FileHeader::new(Collation::default());
        let b = FileHeader::new(Collation::default());
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        bytes[0..16].copy_from_slice(b"InvalidMagic0000");

        assert!(FileHeader::read(&bytes).is_err());
    }

    #[test]
    fn test_checksum_validation() {
        let header = FileHeader::new(Collation::default());
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut bytes);

        // Corrupt a byte
        bytes[100] ^= 0xFF;

        assert!(matches!(
            FileHeader::read(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_long_culture_is_truncated() {
        let header = FileHeader::new(Collation {
            culture: "é".repeat(40),
            ignore_case: true,
        });
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut bytes);
        let restored = FileHeader::read(&bytes).unwrap();
        assert_eq!(restored.collation.culture, "é".repeat(16));
    }
}
