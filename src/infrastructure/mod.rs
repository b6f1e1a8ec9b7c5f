//! Store backends and rail adapters.

pub mod in_memory;
pub mod rails;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
