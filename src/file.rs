//! Component A: the backing file, its header page, and growth.
//!
//! `FileMap` owns the `File` handle and the exclusive lock that enforces
//! the single-handle assumption of spec.md §5, plus a fixed-size mapping of
//! `META_LEN` bytes covering the header page and the busy-page-count table
//! — both live for the handle's whole lifetime, so that one mapping never
//! needs to move. Everything beyond `META_LEN` (chunk bitmaps, individual
//! tree pages) is mapped on demand by the allocator and cache through
//! [`FileMap::map_region`], exactly as the original maps and unmaps those
//! regions independently of the header/busy-table mapping.

use std::fs::File;
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};
use crate::layout::{RawFileHeader, BUSY_PAGE_NUM_POS, HEADER_CHECKSUM_LEN, MAGIC, META_LEN};

pub struct FileMap {
    file: File,
    map: MmapRaw,
    file_size: u64,
}

impl FileMap {
    /// Open (creating if absent) the backing file, lock it exclusively, and
    /// grow it to at least `META_LEN` so the header and busy-count table are
    /// always addressable. Initializes a fresh header on a newly created file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if page_size::get() as u64 != crate::layout::PAGE_SIZE {
            log::warn!(
                "system page size {} differs from store page size {}; mmap granularity may force extra rounding",
                page_size::get(),
                crate::layout::PAGE_SIZE,
            );
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap_or_else(|e| Error::Open(e).fatal());
        file.try_lock_exclusive().unwrap_or_else(|e| Error::Lock(e).fatal());

        let file_size = file.metadata().unwrap_or_else(|e| Error::Open(e).fatal()).len();
        let is_new = file_size < META_LEN;
        let file_size = if is_new {
            Self::grow_file(&file, META_LEN);
            META_LEN
        } else {
            file_size
        };

        let map = MmapOptions::new()
            .len(META_LEN as usize)
            .map_raw(&file)
            .unwrap_or_else(|e| Error::Mmap(e).fatal());
        let mut this = Self { file, map, file_size };

        if is_new {
            this.init_header();
            this.sync_header();
            log::info!("initialized new store file");
        } else {
            this.verify_header()?;
            log::info!("opened existing store file, {file_size} bytes");
        }
        Ok(this)
    }

    /// Fatal per spec.md §7: growing the backing file below its required
    /// size aborts rather than returning, since every caller above this
    /// assumes `ensure_length` succeeded unconditionally.
    fn grow_file(file: &File, requested: u64) {
        file.allocate(requested)
            .unwrap_or_else(|source| Error::Grow { requested, source }.fatal())
    }

    /// §4.A `ensure_length`: grow the backing file so that `[pos, pos+len)`
    /// is addressable, reserving the space so writes into that range cannot
    /// later fail with ENOSPC. No-op if the file is already large enough.
    pub fn ensure_length(&mut self, pos: u64, len: u64) {
        let needed = pos + len;
        if needed <= self.file_size {
            return;
        }
        Self::grow_file(&self.file, needed);
        self.file_size = needed;
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Map a byte range of the file beyond the fixed `META_LEN` header
    /// region — used by the allocator for a chunk's bitmap and by the cache
    /// for an individual page. The caller owns the returned mapping's
    /// lifetime and is responsible for flushing/dropping it.
    pub fn map_region(&self, offset: u64, len: u64) -> MmapRaw {
        MmapOptions::new()
            .offset(offset)
            .len(len as usize)
            .map_raw(&self.file)
            .unwrap_or_else(|e| Error::Mmap(e).fatal())
    }

    fn header_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), std::mem::size_of::<RawFileHeader>()) }
    }

    pub fn header(&self) -> RawFileHeader {
        *bytemuck::from_bytes(self.header_bytes())
    }

    pub fn set_header(&mut self, h: RawFileHeader) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), std::mem::size_of::<RawFileHeader>())
        };
        bytes.copy_from_slice(bytemuck::bytes_of(&h));
    }

    fn init_header(&mut self) {
        let mut h = RawFileHeader {
            magic: MAGIC,
            file_size: self.file_size,
            record_num: 0,
            total_pages: 0,
            spare_pages: 0,
            root_gpid: crate::layout::Gpid::NIL.0,
            level: 0,
            _reserved: 0,
            checksum: 0,
        };
        h.checksum = Self::checksum(&h);
        self.set_header(h);
    }

    fn checksum(h: &RawFileHeader) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&bytemuck::bytes_of(h)[..HEADER_CHECKSUM_LEN])
    }

    fn verify_header(&self) -> Result<()> {
        let h = self.header();
        if h.magic != MAGIC {
            return Err(Error::InvalidFormat("bad magic"));
        }
        if h.checksum != Self::checksum(&h) {
            return Err(Error::InvalidFormat("header checksum mismatch"));
        }
        Ok(())
    }

    /// Recompute the header checksum and flush the header page to disk.
    pub fn sync_header(&mut self) {
        let mut h = self.header();
        h.file_size = self.file_size;
        h.checksum = Self::checksum(&h);
        self.set_header(h);
        self.map
            .flush_range(0, crate::layout::PAGE_SIZE as usize)
            .unwrap_or_else(|e| Error::Sync(e).fatal())
    }

    /// Bytes of the busy-page-count table (one `u32` per chunk slot), valid
    /// for the handle's whole lifetime.
    pub fn busy_table(&self) -> &[u32] {
        let start = BUSY_PAGE_NUM_POS as usize;
        let len = (META_LEN - BUSY_PAGE_NUM_POS) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(start), len) };
        bytemuck::cast_slice(bytes)
    }

    #[allow(clippy::mut_from_ref)]
    pub fn busy_table_mut(&self) -> &mut [u32] {
        let start = BUSY_PAGE_NUM_POS as usize;
        let len = (META_LEN - BUSY_PAGE_NUM_POS) as usize;
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(start), len) };
        bytemuck::cast_slice_mut(bytes)
    }

    pub fn sync_busy_table(&self) {
        self.map
            .flush_range(BUSY_PAGE_NUM_POS as usize, (META_LEN - BUSY_PAGE_NUM_POS) as usize)
            .unwrap_or_else(|e| Error::Sync(e).fatal())
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        self.map.flush().unwrap_or_else(|e| Error::Sync(e).fatal());
        self.file.sync_all().unwrap_or_else(|e| Error::Sync(e).fatal());
        let _ = FileExt::unlock(&self.file);
    }
}
