//! Component B: the chunk/bitmap page allocator.
//!
//! Mirrors `allocator.c`: the busy-page-count table is part of
//! [`crate::file::FileMap`]'s permanent mapping, but at most one chunk's
//! bitmap is ever memory-mapped at a time — `curr_ck` names it, and
//! rotating to a different chunk tears down the old mapping before
//! establishing the new one.

use memmap2::MmapRaw;

use crate::file::FileMap;
use crate::error::{Error, Result};
use crate::layout::{
    chunk_file_offset, Gpid, MAX_CHUNK_NUM, PAGE_BITMAP_LEN, PAGE_BITMAP_PAGES, PAGE_BITMAP_WLEN,
    PAGE_NUM_PER_CK, PAGE_SIZE,
};

pub struct Allocator {
    curr_ck: Option<u32>,
    bitmap: Option<MmapRaw>,
}

fn bitmap_word_bit(lpid: u32) -> (usize, u32) {
    ((lpid >> 6) as usize, lpid & 63)
}

impl Allocator {
    /// Bring up the allocator on an already-open file: pick a starting
    /// chunk with free capacity and map its bitmap.
    pub fn init(file: &mut FileMap) -> Result<Self> {
        let mut alloc = Allocator { curr_ck: None, bitmap: None };
        let ck = find_ck(file, 0).ok_or(Error::OutOfSpace)?;
        alloc.open_ck(file, ck);
        Ok(alloc)
    }

    fn bitmap_words(&self) -> &[u64] {
        let map = self.bitmap.as_ref().expect("no chunk bitmap mapped");
        unsafe { std::slice::from_raw_parts(map.as_ptr() as *const u64, PAGE_BITMAP_WLEN as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bitmap_words_mut(&self) -> &mut [u64] {
        let map = self.bitmap.as_ref().expect("no chunk bitmap mapped");
        unsafe { std::slice::from_raw_parts_mut(map.as_mut_ptr() as *mut u64, PAGE_BITMAP_WLEN as usize) }
    }

    fn pb_isset(&self, lpid: u32) -> bool {
        let (w, b) = bitmap_word_bit(lpid);
        self.bitmap_words()[w] & (1 << b) != 0
    }

    fn pb_set(&self, lpid: u32) {
        let (w, b) = bitmap_word_bit(lpid);
        self.bitmap_words_mut()[w] |= 1 << b;
    }

    fn pb_clr(&self, lpid: u32) {
        let (w, b) = bitmap_word_bit(lpid);
        self.bitmap_words_mut()[w] &= !(1 << b);
    }

    fn close_curr_ck(&mut self) {
        if let (Some(ck), Some(map)) = (self.curr_ck.take(), self.bitmap.take()) {
            map.flush().unwrap_or_else(|e| Error::Sync(e).fatal());
            log::trace!("allocator: closed chunk {ck}");
        }
    }

    fn open_ck(&mut self, file: &mut FileMap, ck: u32) {
        debug_assert!(self.curr_ck.is_none() && self.bitmap.is_none());
        let pos = chunk_file_offset(ck);
        let is_new = file.busy_table()[ck as usize] == 0;
        if is_new {
            file.ensure_length(pos, PAGE_BITMAP_LEN);
        }
        let map = file.map_region(pos, PAGE_BITMAP_LEN);
        self.bitmap = Some(map);
        self.curr_ck = Some(ck);

        if is_new {
            file.busy_table_mut()[ck as usize] = PAGE_BITMAP_PAGES as u32;
            for lpid in 0..PAGE_BITMAP_PAGES as u32 {
                self.pb_set(lpid);
            }
            let mut h = file.header();
            h.total_pages += PAGE_BITMAP_PAGES;
            file.set_header(h);
            log::debug!("allocator: opened fresh chunk {ck}");
        } else {
            log::debug!("allocator: reopened chunk {ck}");
        }
    }

    /// §4.B.3 `alloc_page`.
    pub fn alloc_page(&mut self, file: &mut FileMap) -> Result<Gpid> {
        let mut ck = self.curr_ck.expect("allocator not initialized");
        if file.busy_table()[ck as usize] as u64 >= PAGE_NUM_PER_CK {
            self.close_curr_ck();
            let next = find_ck(file, ck).ok_or(Error::OutOfSpace)?;
            self.open_ck(file, next);
            ck = next;
        }

        let mut found = None;
        for lpid in PAGE_BITMAP_PAGES as u32..PAGE_NUM_PER_CK as u32 {
            if !self.pb_isset(lpid) {
                found = Some(lpid);
                break;
            }
        }
        let lpid = found.ok_or(Error::OutOfSpace)?;
        let gpid = Gpid::from_parts(ck, lpid);

        self.pb_set(lpid);
        file.busy_table_mut()[ck as usize] += 1;

        let pos = gpid.file_offset();
        file.ensure_length(pos, PAGE_SIZE);

        let mut h = file.header();
        h.total_pages += 1;
        file.set_header(h);
        Ok(gpid)
    }

    /// §4.B.4 `free_page`. Freeing a page outside the currently-open chunk
    /// transiently maps that chunk's bitmap, flips the bit, and unmaps it
    /// again — the original only ever freed pages in the chunk it happened
    /// to have open, which this generalizes without disturbing the
    /// "one long-lived chunk mapping" invariant for the allocation cursor.
    ///
    /// `CorruptState` here (the bit wasn't set) is fatal per spec.md §7: it
    /// means the on-disk bitmap disagrees with what this crate believes it
    /// allocated, so there is nothing safe left to return to the caller.
    pub fn free_page(&mut self, file: &mut FileMap, gpid: Gpid) {
        let ck = gpid.ckid();
        let lpid = gpid.lpid();

        if self.curr_ck == Some(ck) {
            if !self.pb_isset(lpid) {
                Error::CorruptState("freeing a page that wasn't allocated").fatal();
            }
            self.pb_clr(lpid);
        } else {
            let map = file.map_region(chunk_file_offset(ck), PAGE_BITMAP_LEN);
            let words = unsafe {
                std::slice::from_raw_parts_mut(map.as_mut_ptr() as *mut u64, PAGE_BITMAP_WLEN as usize)
            };
            let (w, b) = bitmap_word_bit(lpid);
            if words[w] & (1 << b) == 0 {
                Error::CorruptState("freeing a page that wasn't allocated").fatal();
            }
            words[w] &= !(1 << b);
            map.flush().unwrap_or_else(|e| Error::Sync(e).fatal());
        }

        file.busy_table_mut()[ck as usize] -= 1;
        let mut h = file.header();
        h.spare_pages += 1;
        file.set_header(h);
    }

    pub fn sync(&self, file: &FileMap) {
        if let Some(map) = &self.bitmap {
            map.flush().unwrap_or_else(|e| Error::Sync(e).fatal());
        }
        file.sync_busy_table();
    }

    pub fn close(mut self, file: &mut FileMap) {
        self.close_curr_ck();
        file.sync_busy_table();
    }
}

/// §4.B.2 `find_ck`, fixed per spec.md §9: the candidate id checked each
/// iteration is the rotated `r`, not the raw loop counter.
fn find_ck(file: &FileMap, start: u32) -> Option<u32> {
    let busy = file.busy_table();
    for i in 0..MAX_CHUNK_NUM as u32 {
        let r = (start + i) % MAX_CHUNK_NUM as u32;
        if (busy[r as usize] as u64) < PAGE_NUM_PER_CK {
            return Some(r);
        }
    }
    None
}

const _: () = assert!(PAGE_BITMAP_WLEN * 8 == PAGE_BITMAP_LEN);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tmp() -> (tempfile::TempDir, FileMap) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        let file = FileMap::open(&path).unwrap();
        (dir, file)
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let (_dir, mut file) = open_tmp();
        let mut alloc = Allocator::init(&mut file).unwrap();
        let a = alloc.alloc_page(&mut file).unwrap();
        let b = alloc.alloc_page(&mut file).unwrap();
        assert_ne!(a, b);
        alloc.free_page(&mut file, a);
        let c = alloc.alloc_page(&mut file).unwrap();
        // the freed page is reused before scanning further into the chunk
        assert_eq!(a, c);
    }

    #[test]
    fn fresh_chunk_reserves_bitmap_pages() {
        let (_dir, mut file) = open_tmp();
        let alloc = Allocator::init(&mut file).unwrap();
        for lpid in 0..PAGE_BITMAP_PAGES as u32 {
            assert!(alloc.pb_isset(lpid));
        }
        assert!(!alloc.pb_isset(PAGE_BITMAP_PAGES as u32));
    }

    #[test]
    fn free_page_in_non_current_chunk() {
        let (_dir, mut file) = open_tmp();
        let mut alloc = Allocator::init(&mut file).unwrap();
        let first_ck_page = alloc.alloc_page(&mut file).unwrap();
        // Force rotation to a new chunk by exhausting the busy count artificially.
        let ck = alloc.curr_ck.unwrap();
        file.busy_table_mut()[ck as usize] = PAGE_NUM_PER_CK as u32;
        let other_chunk_page = alloc.alloc_page(&mut file).unwrap();
        assert_ne!(other_chunk_page.ckid(), first_ck_page.ckid());
        // Freeing a page in the now-non-current first chunk must still work.
        alloc.free_page(&mut file, first_ck_page);
    }
}
