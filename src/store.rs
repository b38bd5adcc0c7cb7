//! Component E: the `KvStore` handle tying the file, allocator, cache, and
//! B+ tree together, and its open/close lifecycle.

use std::path::Path;

use crate::alloc::Allocator;
use crate::btree::{self, Cursor, TreeCtx};
use crate::cache::PageCache;
use crate::error::Result;
use crate::file::FileMap;

/// A single embedded key-value store, backed by one file.
///
/// Not safe for concurrent use from multiple threads (spec.md §5): a
/// handle assumes exclusive access to its backing file for its entire
/// lifetime, enforced at open time with an OS-level exclusive lock.
pub struct KvStore {
    file: FileMap,
    alloc: Allocator,
    cache: PageCache,
}

impl KvStore {
    /// §4.E `open`: open-or-create the backing file, initialize the header
    /// on a fresh file, bring up the allocator and cache.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = FileMap::open(path)?;
        let alloc = Allocator::init(&mut file)?;
        let cache = PageCache::new();
        log::info!("store open, {} records, level {}", file.header().record_num, file.header().level);
        Ok(KvStore { file, alloc, cache })
    }

    fn ctx(&mut self) -> TreeCtx<'_> {
        TreeCtx { file: &mut self.file, alloc: &mut self.alloc, cache: &mut self.cache }
    }

    /// `get(handle, k)`.
    pub fn get(&mut self, k: u64) -> Result<Option<u64>> {
        let mut ctx = self.ctx();
        btree::get(&mut ctx, k)
    }

    /// `put(handle, k, v)`: insert or replace.
    pub fn put(&mut self, k: u64, v: u64) -> Result<()> {
        let mut ctx = self.ctx();
        btree::put(&mut ctx, k, v)
    }

    /// `del(handle, k)`: returns `true` if a record was removed.
    pub fn del(&mut self, k: u64) -> Result<bool> {
        let mut ctx = self.ctx();
        btree::del(&mut ctx, k)
    }

    /// `open_cursor(handle, start_key, end_key)`: half-open range `[start_key, end_key)`.
    pub fn open_cursor(&mut self, start_key: u64, end_key: u64) -> Result<Cursor> {
        let mut ctx = self.ctx();
        btree::open_cursor(&mut ctx, start_key, end_key)
    }

    /// `cursor_next(cursor)`.
    pub fn cursor_next(&mut self, cursor: &mut Cursor) -> Result<Option<(u64, u64)>> {
        let mut ctx = self.ctx();
        btree::cursor_next(&mut ctx, cursor)
    }

    /// `close_cursor(cursor)`.
    pub fn close_cursor(&mut self, cursor: Cursor) {
        let mut ctx = self.ctx();
        btree::close_cursor(&mut ctx, cursor)
    }

    pub fn record_num(&self) -> u64 {
        self.file.header().record_num
    }

    pub fn is_empty(&self) -> bool {
        self.file.header().level == 0
    }

    /// Explicit durability point short of `close`: flushes every dirty
    /// cached page, the current chunk bitmap, the busy-count table, and
    /// the header. Any failure along this path is fatal per spec.md §7, so
    /// this never actually returns `Err` — it stays `Result` so callers can
    /// keep using `?` against it.
    pub fn sync_all(&mut self) -> Result<()> {
        self.cache.sync_all();
        self.alloc.sync(&self.file);
        self.file.sync_header();
        Ok(())
    }

    /// §4.E `close`: exit the cache (syncing dirty pages), exit the
    /// allocator (syncing bitmaps and counts), sync and unmap the header,
    /// fsync and close the file. Consumes the handle so it cannot be used
    /// after close. As with [`KvStore::sync_all`], every step here is fatal
    /// on failure rather than returning `Err`.
    pub fn close(self) -> Result<()> {
        let KvStore { mut file, alloc, mut cache } = self;
        cache.exit_cache();
        alloc.close(&mut file);
        file.sync_header();
        log::info!("store closed");
        Ok(())
        // `FileMap::drop` performs the final fsync/unlock/close.
    }
}
