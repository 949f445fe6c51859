//! Page layer: fixed-size pages with a backward-growing slot table.
//!
//! Every page is an owned 8192-byte buffer:
//! - A 32-byte header with identity, log and space accounting fields
//! - Record content growing forward from the header
//! - A slot table growing backward from the end of the page
//!
//! Data blocks and skip-list nodes are records addressed by
//! `(page id, slot index)`; their layouts live with the stores that own them.

pub(crate) mod header;
mod slotted;

pub use header::PageHeader;
pub use slotted::SlottedPage;

use crate::types::PAGE_SIZE;

/// A raw page buffer
#[derive(Clone)]
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Create a page buffer from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::new();
        let len = bytes.len().min(PAGE_SIZE);
        buf.data[..len].copy_from_slice(&bytes[..len]);
        buf
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..]
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..]
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data[..]
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageBuf({} bytes)", PAGE_SIZE)
    }
}
