//! A single 4 KiB B+ tree page: a header followed by a fixed-capacity,
//! strictly-ascending array of `(k, v)` records.
//!
//! Every record here is a fixed 16 bytes, so the page never needs to track
//! a data/slot split or reclaim fragmentation — records shift in place,
//! exactly as `kvdb.c`'s `insert_rec`/`delete_rec` do it.

use bytemuck::{bytes_of, bytes_of_mut};

use crate::layout::{Gpid, RawPageHeader, RawRecord, PAGE_LEAF, PAGE_SIZE, RECORD_NUM_PG};

const HEADER_SIZE: usize = std::mem::size_of::<RawPageHeader>();
const RECORD_SIZE: usize = std::mem::size_of::<RawRecord>();

/// A borrowed view over one page's raw bytes.
///
/// Constructing this does not validate the bytes; callers that load a page
/// from disk rather than freshly initializing it should call [`PageView::validate`].
pub struct PageView<'a> {
    bytes: &'a mut [u8],
}

/// Outcome of a single in-page insert, mirroring `kvdb.c`'s `REC_INSERTED` /
/// `REC_REPLACED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
}

impl<'a> PageView<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        debug_assert_eq!(bytes.len(), PAGE_SIZE as usize);
        Self { bytes }
    }

    /// Verify that `record_num` is within bounds. Pages read off disk should
    /// be validated once before use; pages this process just initialized
    /// don't need it. Fatal per spec.md §7: a page with a record_num outside
    /// its bitmap-sized range means the on-disk layout is inconsistent with
    /// what this crate could have written.
    pub fn validate(&self) {
        let n = self.header().record_num;
        if !(0..=RECORD_NUM_PG as i32).contains(&n) {
            crate::error::Error::CorruptState("page record_num out of range").fatal();
        }
    }

    fn header(&self) -> RawPageHeader {
        *bytemuck::from_bytes(&self.bytes[..HEADER_SIZE])
    }

    fn set_header(&mut self, h: RawPageHeader) {
        bytes_of_mut(&mut self.bytes[..HEADER_SIZE]).copy_from_slice(bytes_of(&h));
    }

    pub fn record_num(&self) -> usize {
        self.header().record_num as usize
    }

    pub(crate) fn set_record_num(&mut self, n: usize) {
        let mut h = self.header();
        h.record_num = n as i32;
        self.set_header(h);
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags & PAGE_LEAF != 0
    }

    pub fn next(&self) -> Gpid {
        Gpid(self.header().next)
    }

    pub fn set_next(&mut self, next: Gpid) {
        let mut h = self.header();
        h.next = next.0;
        self.set_header(h);
    }

    /// Reset the page to an empty LEAF or BRANCH with no successor.
    pub fn initialize(&mut self, leaf: bool) {
        self.set_header(RawPageHeader {
            record_num: 0,
            flags: if leaf { PAGE_LEAF } else { 0 },
            next: Gpid::NIL.0,
        });
    }

    pub fn set_flags_leaf(&mut self, leaf: bool) {
        let mut h = self.header();
        h.flags = if leaf { PAGE_LEAF } else { 0 };
        self.set_header(h);
    }

    fn record_offset(i: usize) -> usize {
        HEADER_SIZE + i * RECORD_SIZE
    }

    pub fn record(&self, i: usize) -> RawRecord {
        debug_assert!(i < self.record_num());
        let off = Self::record_offset(i);
        *bytemuck::from_bytes(&self.bytes[off..off + RECORD_SIZE])
    }

    fn set_record_at(&mut self, i: usize, rec: RawRecord) {
        let off = Self::record_offset(i);
        bytes_of_mut(&mut self.bytes[off..off + RECORD_SIZE]).copy_from_slice(bytes_of(&rec));
    }

    /// Copy records `[from, record_num())` out of this page, as used when
    /// splitting the second half into a new page.
    pub fn copy_tail_into(&self, from: usize, dst: &mut PageView<'_>) {
        let n = self.record_num();
        for (j, i) in (from..n).enumerate() {
            dst.set_record_at(j, self.record(i));
        }
    }

    /// §4.D.1 `find_key`: bounded binary search.
    ///
    /// Returns an index `i` such that `rec[i].k == k`, or
    /// `rec[i].k < k < rec[i+1].k`. Returns `-1` if the page is empty or `k`
    /// precedes every key; returns `record_num() - 1` if `k` is at least the
    /// largest key.
    pub fn find_key(&self, k: u64) -> i32 {
        let n = self.record_num();
        if n == 0 || k < self.record(0).k {
            return -1;
        }
        let last = n - 1;
        if k >= self.record(last).k {
            return last as i32;
        }
        let (mut lo, mut hi) = (0i64, last as i64);
        while lo <= hi {
            let mi = (lo + hi) / 2;
            let mk = self.record(mi as usize).k;
            if k == mk {
                return mi as i32;
            }
            if k > mk {
                if k < self.record(mi as usize + 1).k {
                    return mi as i32;
                }
                lo = mi + 1;
            } else {
                hi = mi - 1;
            }
        }
        unreachable!("find_key: binary search fell through on a sorted page")
    }

    /// §4.D.4 `insert_rec`. `pos` must be `max(find_key(self, rec.k), 0)`
    /// except for the root-split sentinel case where it is `-1`, meaning
    /// "insert before every existing record" (only legal when the page is
    /// freshly made and empty).
    pub fn insert_rec(&mut self, pos: i32, rec: RawRecord) -> InsertOutcome {
        let n = self.record_num();
        if n == 0 {
            self.set_record_at(0, rec);
            self.set_record_num(1);
            return InsertOutcome::Inserted;
        }
        debug_assert!(n < RECORD_NUM_PG);
        let pos = pos as usize;
        let at = self.record(pos);
        if rec.k > at.k {
            for i in (pos + 1..n).rev() {
                let moved = self.record(i);
                self.set_record_at(i + 1, moved);
            }
            self.set_record_at(pos + 1, rec);
            self.set_record_num(n + 1);
            InsertOutcome::Inserted
        } else if rec.k == at.k {
            debug_assert!(self.is_leaf(), "branch records are never replaced");
            self.set_record_at(pos, rec);
            InsertOutcome::Replaced
        } else {
            debug_assert_eq!(pos, 0, "rec.k < p.rec[pos].k only legal at pos 0");
            for i in (0..n).rev() {
                let moved = self.record(i);
                self.set_record_at(i + 1, moved);
            }
            self.set_record_at(0, rec);
            self.set_record_num(n + 1);
            InsertOutcome::Inserted
        }
    }

    /// Remove the record at `pos`, shifting later records left.
    pub fn delete_rec(&mut self, pos: usize) {
        let n = self.record_num();
        debug_assert!(pos < n);
        for i in pos..n - 1 {
            let moved = self.record(i + 1);
            self.set_record_at(i, moved);
        }
        self.set_record_num(n - 1);
    }
}
