//! On-disk constants and raw record layouts.
//!
//! Every constant here is bit-exact with the file format: changing one
//! changes what a store file means, not just how this crate reads it.

use bytemuck::{Pod, Zeroable};

/// Size of a single page, and the unit of allocation, caching, and B+ tree node.
pub const PAGE_SIZE: u64 = 4096;

/// Bytes reserved at the front of the file for the header and busy-count table.
pub const META_LEN: u64 = 2 * 1024 * 1024;

/// Offset of the busy-page-count table.
pub const BUSY_PAGE_NUM_POS: u64 = 1024 * 1024;

/// Size in bytes of one chunk's page bitmap.
pub const PAGE_BITMAP_LEN: u64 = 64 * 1024;

/// Number of pages a chunk bitmap occupies at the front of its own chunk.
pub const PAGE_BITMAP_PAGES: u64 = PAGE_BITMAP_LEN / PAGE_SIZE;

/// Number of pages per chunk (one bit per page in the bitmap).
pub const PAGE_NUM_PER_CK: u64 = PAGE_BITMAP_LEN * 8;

/// Number of 64-bit words in a chunk bitmap.
pub const PAGE_BITMAP_WLEN: u64 = PAGE_BITMAP_LEN / 8;

/// Maximum number of addressable chunks.
pub const MAX_CHUNK_NUM: u64 = 256 * 1024;

/// Record capacity of a single page: `floor(PAGE_SIZE / 16) - 1`.
pub const RECORD_NUM_PG: usize = (PAGE_SIZE as usize / 16) - 1;

/// Sentinel value for "no page".
pub const GPID_NIL: u64 = u64::MAX;

/// File format identifier, 7 ASCII bytes null-padded to 8.
pub const MAGIC: [u8; 8] = *b"kv@enmo\0";

/// Maximum number of simultaneously mapped pages in the page cache.
pub const MAX_MAPPED_PG: usize = (1 << 20) / PAGE_SIZE as usize;

/// Branch/leaf flag bit: set on LEAF pages, clear on BRANCH pages.
pub const PAGE_LEAF: u32 = 1 << 0;

/// A global page identifier: a 64-bit index naming a single page in the file.
///
/// `Gpid::NIL` is the all-ones sentinel meaning "no page" — used for an empty
/// tree's root pointer and a leaf's absent successor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gpid(pub u64);

impl Gpid {
    pub const NIL: Gpid = Gpid(GPID_NIL);

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == GPID_NIL
    }

    /// Chunk id this page belongs to.
    #[inline]
    pub fn ckid(self) -> u32 {
        (self.0 / PAGE_NUM_PER_CK) as u32
    }

    /// Local page id within its chunk.
    #[inline]
    pub fn lpid(self) -> u32 {
        (self.0 % PAGE_NUM_PER_CK) as u32
    }

    #[inline]
    pub fn from_parts(ckid: u32, lpid: u32) -> Gpid {
        Gpid(ckid as u64 * PAGE_NUM_PER_CK + lpid as u64)
    }

    /// Byte offset of this page's first byte in the backing file.
    #[inline]
    pub fn file_offset(self) -> u64 {
        META_LEN + self.0 * PAGE_SIZE
    }
}

impl std::fmt::Debug for Gpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "Gpid(NIL)")
        } else {
            write!(f, "Gpid({})", self.0)
        }
    }
}

/// Byte offset of a chunk's first page (its bitmap) in the backing file.
#[inline]
pub fn chunk_file_offset(ckid: u32) -> u64 {
    Gpid::from_parts(ckid, 0).file_offset()
}

/// The file header record, exactly one page wide at offset 0.
///
/// `checksum` is a supplement to spec.md's literal field list (see
/// `SPEC_FULL.md` §B): an xxh3 hash of every preceding byte of the header,
/// recomputed on every sync and checked on open, to catch header corruption
/// that has no B+-tree-level redundancy to detect it.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RawFileHeader {
    pub magic: [u8; 8],
    pub file_size: u64,
    pub record_num: u64,
    pub total_pages: u64,
    pub spare_pages: u64,
    pub root_gpid: u64,
    pub level: u32,
    pub _reserved: u32,
    pub checksum: u64,
}

/// The part of the header that's checksummed — everything but the checksum itself.
pub const HEADER_CHECKSUM_LEN: usize = std::mem::size_of::<RawFileHeader>() - 8;

const _: () = assert!(std::mem::size_of::<RawFileHeader>() <= PAGE_SIZE as usize);

/// A page header: record count, LEAF/BRANCH flag, and the leaf successor link.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RawPageHeader {
    pub record_num: i32,
    pub flags: u32,
    pub next: u64,
}

const _: () = assert!(std::mem::size_of::<RawPageHeader>() == 16);

/// A single fixed-width `(k, v)` record. On a LEAF page `v` is the user value;
/// on a BRANCH page `v` is the gpid of the child subtree whose smallest key is `k`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq, Debug, Default)]
pub struct RawRecord {
    pub k: u64,
    pub v: u64,
}

const _: () = assert!(std::mem::size_of::<RawRecord>() == 16);

const _: () = assert!(
    std::mem::size_of::<RawPageHeader>() + RECORD_NUM_PG * std::mem::size_of::<RawRecord>()
        == PAGE_SIZE as usize
);
