//! Error types for the storage engine.

use thiserror::Error;
use crate::types::{PageId, RowAddress};

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page was not found
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// Page does not have the space the allocation map promised
    #[error("Page {page_id} is full, need {needed} bytes but only {available} available")]
    PageFull {
        page_id: PageId,
        needed: usize,
        available: usize,
    },

    /// Encoded index key exceeds the node limit
    #[error("Index key too long: {size} bytes (max: {max})")]
    IndexKeyTooLong { size: usize, max: usize },

    /// Document exceeds the maximum chain length
    #[error("Document too large: {size} bytes (max: {max})")]
    DocumentTooLarge { size: usize, max: usize },

    /// Data corruption detected (e.g., checksum mismatch)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid page format or type
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Database file is corrupted or has invalid format
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// Unique index already holds the key
    #[error("Duplicate key in unique index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    /// A checkpoint discarded the snapshot a cursor was reading
    #[error("Read version {read_version} expired (oldest valid: {oldest})")]
    ReadVersionExpired { read_version: u64, oldest: u64 },

    /// The operation observed its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A lock was not granted within the configured timeout
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction is closed")]
    TransactionClosed,

    /// No collection with that name
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// No index with that name on the collection
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Master document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid page error
    pub fn invalid_page(msg: impl Into<String>) -> Self {
        Self::InvalidPage(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an invalid database file error
    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }

    /// Create a corruption error pointing at a record
    pub fn bad_record(address: RowAddress, msg: impl std::fmt::Display) -> Self {
        Self::Corruption(format!("record {}: {}", address, msg))
    }

    /// Corruption and capacity errors mean the engine state can no longer be
    /// trusted; the caller should reopen the database.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_) | Self::PageFull { .. } | Self::InvalidPage(_)
        )
    }
}
