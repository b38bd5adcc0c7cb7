//! An embedded, single-process store mapping 64-bit unsigned keys to
//! 64-bit unsigned values in one backing file.
//!
//! The store is a fixed-fanout B+ tree (component `btree`) whose nodes are
//! `PAGE_SIZE` pages fetched through a bounded page cache (`cache`), backed
//! by file space handed out by a chunk/bitmap allocator (`alloc`) over a
//! single memory-mapped file (`file`). `store::KvStore` ties these
//! together into the handle applications open, read, write, and close.
//!
//! Concurrency across threads or processes is out of scope: a handle
//! assumes exclusive access to its file for its whole lifetime. There is
//! no write-ahead log and no transaction support — durability is only
//! guaranteed for data synced at [`store::KvStore::close`] or
//! [`store::KvStore::sync_all`].

pub mod alloc;
pub mod btree;
pub mod cache;
pub mod error;
pub mod file;
pub mod layout;
pub mod page;
pub mod store;

pub use btree::Cursor;
pub use error::{Error, Result};
pub use store::KvStore;
