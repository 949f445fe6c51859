//! Storage layer: file I/O, the file header and the allocation map.

mod alloc_map;
mod disk_manager;
pub mod extent;
mod file_header;

pub use alloc_map::{AllocDelta, AllocationMap};
pub use disk_manager::{file_offset, DiskManager, DiskManagerImpl, MemoryDiskManager};
pub use extent::PageState;
pub use file_header::{FileHeader, FILE_HEADER_SIZE, FORMAT_VERSION, MAGIC};
