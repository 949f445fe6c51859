//! Disk manager implementation.
//!
//! The disk manager reads and writes raw pages by on-disk position. It knows
//! nothing about logical page ids, the log or checkpoints; those live in the
//! `wal` module. Two backends exist: a file and an in-memory byte vector used
//! by tests to capture and replay crash states.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::storage::{FileHeader, FILE_HEADER_SIZE};
use crate::types::{PageId, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::trace;

/// Byte offset of a page position inside the file
pub fn file_offset(position: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + position as u64 * PAGE_SIZE as u64
}

/// Trait for disk I/O operations
///
/// This abstraction allows swapping the storage backend or injecting
/// failures in tests.
pub trait DiskManager: Send + Sync {
    /// Read the file header, or `None` for a new (empty) file
    fn read_header(&self) -> Result<Option<FileHeader>>;

    /// Overwrite the file header
    fn write_header(&self, header: &FileHeader) -> Result<()>;

    /// Read the page stored at `position`
    fn read_page(&self, position: u32) -> Result<PageBuf>;

    /// Write a full page at `position`, extending the file if needed
    fn write_page(&self, position: u32, data: &[u8]) -> Result<()>;

    /// Overwrite a single byte of the page at `position`
    fn write_page_byte(&self, position: u32, offset: usize, value: u8) -> Result<()>;

    /// Number of complete pages after the header
    fn page_count(&self) -> Result<u32>;

    /// Cut the file after `pages` pages
    fn truncate(&self, pages: u32) -> Result<()>;

    /// Flush everything written so far to stable storage
    fn sync(&self) -> Result<()>;
}

fn check_page_len(data: &[u8]) -> Result<()> {
    if data.len() != PAGE_SIZE {
        return Err(StorageError::invalid_operation(format!(
            "page data must be {} bytes, got {}",
            PAGE_SIZE,
            data.len()
        )));
    }
    Ok(())
}

fn check_byte_offset(offset: usize) -> Result<()> {
    if offset >= PAGE_SIZE {
        return Err(StorageError::invalid_operation(format!(
            "byte offset {} is outside the page",
            offset
        )));
    }
    Ok(())
}

/// File-based disk manager implementation
pub struct DiskManagerImpl {
    /// The database file
    file: RwLock<File>,
    /// Whether `sync` reaches the device
    sync_on_commit: bool,
}

impl DiskManagerImpl {
    /// Open or create a database file
    pub fn open(path: &Path, sync_on_commit: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file: RwLock::new(file),
            sync_on_commit,
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }
}

impl DiskManager for DiskManagerImpl {
    fn read_header(&self) -> Result<Option<FileHeader>> {
        if self.len()? < FILE_HEADER_SIZE as u64 {
            return Ok(None);
        }

        let mut buf = vec![0u8; FILE_HEADER_SIZE];
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;

        FileHeader::read(&buf).map(Some)
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut buf = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut buf);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn read_page(&self, position: u32) -> Result<PageBuf> {
        if position >= self.page_count()? {
            return Err(StorageError::PageNotFound(PageId::new(position)));
        }

        trace!(position, "reading page");

        let mut buf = PageBuf::new();
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(file_offset(position)))?;
        file.read_exact(buf.as_bytes_mut())?;

        Ok(buf)
    }

    fn write_page(&self, position: u32, data: &[u8]) -> Result<()> {
        check_page_len(data)?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(file_offset(position)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_page_byte(&self, position: u32, offset: usize, value: u8) -> Result<()> {
        check_byte_offset(offset)?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(file_offset(position) + offset as u64))?;
        file.write_all(&[value])?;
        Ok(())
    }

    fn page_count(&self) -> Result<u32> {
        let len = self.len()?;
        Ok((len.saturating_sub(FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64) as u32)
    }

    fn truncate(&self, pages: u32) -> Result<()> {
        let file = self.file.write();
        file.set_len(file_offset(pages))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.sync_on_commit {
            let file = self.file.write();
            file.sync_data()?;
        }
        Ok(())
    }
}

/// In-memory disk manager
///
/// Holds the exact byte image a file would have. Tests snapshot it with
/// [`MemoryDiskManager::to_bytes`] and reopen from any captured state, or
/// arm [`MemoryDiskManager::fail_after`] to cut writes off mid-operation.
#[derive(Default)]
pub struct MemoryDiskManager {
    bytes: RwLock<Vec<u8>>,
    /// Writes still allowed before every write fails
    write_budget: Mutex<Option<usize>>,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously captured image
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            write_budget: Mutex::new(None),
        }
    }

    /// Copy of the current image
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Let `writes` more writes through, then fail every write as if the
    /// process had died
    pub fn fail_after(&self, writes: usize) {
        *self.write_budget.lock() = Some(writes);
    }

    fn spend_write(&self) -> Result<()> {
        let mut budget = self.write_budget.lock();
        match budget.as_mut() {
            Some(0) => Err(StorageError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated crash",
            ))),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.spend_write()?;
        let mut bytes = self.bytes.write();
        if bytes.len() < offset + data.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_header(&self) -> Result<Option<FileHeader>> {
        let bytes = self.bytes.read();
        if bytes.len() < FILE_HEADER_SIZE {
            return Ok(None);
        }
        FileHeader::read(&bytes[..FILE_HEADER_SIZE]).map(Some)
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut buf = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut buf);
        self.write_at(0, &buf)
    }

    fn read_page(&self, position: u32) -> Result<PageBuf> {
        if position >= self.page_count()? {
            return Err(StorageError::PageNotFound(PageId::new(position)));
        }
        let offset = file_offset(position) as usize;
        let bytes = self.bytes.read();
        Ok(PageBuf::from_bytes(&bytes[offset..offset + PAGE_SIZE]))
    }

    fn write_page(&self, position: u32, data: &[u8]) -> Result<()> {
        check_page_len(data)?;
        self.write_at(file_offset(position) as usize, data)
    }

    fn write_page_byte(&self, position: u32, offset: usize, value: u8) -> Result<()> {
        check_byte_offset(offset)?;
        self.write_at(file_offset(position) as usize + offset, &[value])
    }

    fn page_count(&self) -> Result<u32> {
        let len = self.bytes.read().len();
        Ok((len.saturating_sub(FILE_HEADER_SIZE) / PAGE_SIZE) as u32)
    }

    fn truncate(&self, pages: u32) -> Result<()> {
        self.spend_write()?;
        self.bytes.write().truncate(file_offset(pages) as usize);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
