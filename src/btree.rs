//! Component D: the B+ tree — `put`, `get`, `del`, and forward cursors.
//!
//! Every operation descends through pages fetched from the page cache under
//! the strict "get, mutate, mark dirty, put" discipline spec.md §4.C and
//! §5 require: no path here holds more pins than its tree depth plus two,
//! and every `get_page` is balanced by exactly one `put_page` before the
//! function returns (including on early-return branches like `NotFound`).

use crate::alloc::Allocator;
use crate::cache::{PageCache, PagePin};
use crate::error::{Error, Result};
use crate::file::FileMap;
use crate::layout::{Gpid, RawRecord, RECORD_NUM_PG};
use crate::page::{InsertOutcome, PageView};

/// Borrowed access to the three subsystems a tree operation needs,
/// threaded through the recursion instead of stored on a long-lived type —
/// `KvStore` owns `FileMap`/`Allocator`/`PageCache` and builds one of these
/// per call.
pub struct TreeCtx<'a> {
    pub file: &'a mut FileMap,
    pub alloc: &'a mut Allocator,
    pub cache: &'a mut PageCache,
}

/// Outcome of a (possibly recursive) insert attempt, mirroring `kvdb.c`'s
/// `REC_INSERTED` / `REC_REPLACED` / `PAGE_SPLIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertStatus {
    Inserted,
    Replaced,
    Split,
}

/// Outcome of a (possibly recursive) delete attempt, mirroring `kvdb.c`'s
/// `REC_NOT_FOUND` / `REC_OK` / `PAGE_DELETED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelStatus {
    NotFound,
    Ok,
    Deleted,
}

/// §4.D.2 top-level `put(k, v)`.
pub fn put(ctx: &mut TreeCtx<'_>, k: u64, v: u64) -> Result<()> {
    if ctx.file.header().level == 0 {
        bootstrap_root(ctx)?;
    }

    let rec = RawRecord { k, v };
    let mut status = bpt_insert(ctx, None, -1, root_gpid(ctx), rec)?;
    // A SPLIT bubbling all the way past the root means the root itself was
    // full and `bpt_split` already installed a fresh root above it; retry
    // the whole insert once against the new root, exactly as any interior
    // level would retry against its own freshly-split child.
    let mut attempts = 0;
    while status == InsertStatus::Split {
        attempts += 1;
        if attempts > 2 {
            Error::CorruptState("insert retry budget exceeded at root").fatal();
        }
        status = bpt_insert(ctx, None, -1, root_gpid(ctx), rec)?;
    }

    if status == InsertStatus::Inserted {
        let mut h = ctx.file.header();
        h.record_num += 1;
        ctx.file.set_header(h);
    }
    Ok(())
}

fn root_gpid(ctx: &TreeCtx<'_>) -> Gpid {
    Gpid(ctx.file.header().root_gpid)
}

fn bootstrap_root(ctx: &mut TreeCtx<'_>) -> Result<()> {
    let gpid = ctx.alloc.alloc_page(ctx.file)?;
    let pin = ctx.cache.get_page(ctx.file, gpid);
    PageView::new(pin.bytes_mut()).initialize(true);
    ctx.cache.mark_dirty(&pin);
    ctx.cache.put_page(pin);

    let mut h = ctx.file.header();
    h.root_gpid = gpid.0;
    h.level = 1;
    ctx.file.set_header(h);
    log::debug!("btree: bootstrapped root leaf {gpid:?}");
    Ok(())
}

/// §4.D.2 `bpt_insert`. `parent` is `None` iff `curr_gpid` is the current
/// root (the conceptual above-root parent); `parent_pos` is meaningless in
/// that case.
fn bpt_insert(
    ctx: &mut TreeCtx<'_>,
    parent: Option<&mut PagePin>,
    parent_pos: i32,
    curr_gpid: Gpid,
    rec: RawRecord,
) -> Result<InsertStatus> {
    let mut pin = ctx.cache.get_page(ctx.file, curr_gpid);
    let full = PageView::new(pin.bytes_mut()).record_num() == RECORD_NUM_PG;

    if full {
        bpt_split(ctx, parent, parent_pos, curr_gpid, &mut pin)?;
        ctx.cache.put_page(pin);
        return Ok(InsertStatus::Split);
    }

    let is_leaf = PageView::new(pin.bytes_mut()).is_leaf();
    if is_leaf {
        let pos = PageView::new(pin.bytes_mut()).find_key(rec.k).max(0);
        let outcome = PageView::new(pin.bytes_mut()).insert_rec(pos, rec);
        ctx.cache.mark_dirty(&pin);
        ctx.cache.put_page(pin);
        return Ok(match outcome {
            InsertOutcome::Inserted => InsertStatus::Inserted,
            InsertOutcome::Replaced => InsertStatus::Replaced,
        });
    }

    // Branch: descend, retrying at most once if the child we picked splits
    // out from under us (the freshly-inserted parent pointer means the
    // correct child for `rec.k` must be recomputed).
    let mut attempts = 0;
    loop {
        attempts += 1;
        let pos = PageView::new(pin.bytes_mut()).find_key(rec.k).max(0);
        let child_gpid = Gpid(PageView::new(pin.bytes_mut()).record(pos).v);
        let status = bpt_insert(ctx, Some(&mut pin), pos, child_gpid, rec)?;
        if status == InsertStatus::Split {
            if attempts >= 2 {
                ctx.cache.put_page(pin);
                Error::CorruptState("insert retry budget exceeded").fatal();
            }
            continue;
        }
        ctx.cache.put_page(pin);
        return Ok(status);
    }
}

/// §4.D.3 `bpt_split`. Splits the full page `curr` (pinned via `curr_pin`)
/// into itself (first half) and a freshly allocated page (second half),
/// then threads the new pointer upward: into `parent` at `parent_pos` if
/// one was supplied, or into a brand new root if `curr_gpid` is currently
/// the root.
fn bpt_split(
    ctx: &mut TreeCtx<'_>,
    parent: Option<&mut PagePin>,
    parent_pos: i32,
    curr_gpid: Gpid,
    curr_pin: &mut PagePin,
) -> Result<()> {
    let new_gpid = ctx.alloc.alloc_page(ctx.file)?;
    let mut new_pin = ctx.cache.get_page(ctx.file, new_gpid);

    let half = RECORD_NUM_PG / 2;
    let (is_leaf, old_next) = {
        let v = PageView::new(curr_pin.bytes_mut());
        (v.is_leaf(), v.next())
    };

    {
        let mut new_view = PageView::new(new_pin.bytes_mut());
        new_view.initialize(is_leaf);
        let curr_view = PageView::new(curr_pin.bytes_mut());
        curr_view.copy_tail_into(half, &mut new_view);
        new_view.set_record_num(RECORD_NUM_PG - half);
        new_view.set_next(old_next);
    }
    let first_new_key = PageView::new(new_pin.bytes_mut()).record(0).k;

    {
        let mut curr_view = PageView::new(curr_pin.bytes_mut());
        curr_view.set_record_num(half);
        curr_view.set_next(new_gpid);
    }
    ctx.cache.mark_dirty(curr_pin);
    ctx.cache.mark_dirty(&new_pin);

    match parent {
        Some(parent_pin) => {
            let mut parent_view = PageView::new(parent_pin.bytes_mut());
            parent_view.insert_rec(parent_pos, RawRecord { k: first_new_key, v: new_gpid.0 });
            ctx.cache.mark_dirty(parent_pin);
        }
        None => {
            // `curr_gpid` is the root: bootstrap a new branch root above it.
            let curr_first_key = PageView::new(curr_pin.bytes_mut()).record(0).k;
            let new_root_gpid = ctx.alloc.alloc_page(ctx.file)?;
            let new_root_pin = ctx.cache.get_page(ctx.file, new_root_gpid);
            {
                let mut root_view = PageView::new(new_root_pin.bytes_mut());
                root_view.initialize(false);
                root_view.insert_rec(-1, RawRecord { k: curr_first_key, v: curr_gpid.0 });
                root_view.insert_rec(0, RawRecord { k: first_new_key, v: new_gpid.0 });
            }
            ctx.cache.mark_dirty(&new_root_pin);
            ctx.cache.put_page(new_root_pin);

            let mut h = ctx.file.header();
            h.root_gpid = new_root_gpid.0;
            h.level += 1;
            ctx.file.set_header(h);
            log::debug!("btree: split root {curr_gpid:?}, new root {new_root_gpid:?}");
        }
    }

    ctx.cache.put_page(new_pin);
    Ok(())
}

/// §4.D.5 top-level `del(k)`.
pub fn del(ctx: &mut TreeCtx<'_>, k: u64) -> Result<bool> {
    let header = ctx.file.header();
    if header.level == 0 {
        return Ok(false);
    }
    let status = bpt_del(ctx, Gpid(header.root_gpid), k)?;
    match status {
        DelStatus::NotFound => Ok(false),
        DelStatus::Ok => {
            let mut h = ctx.file.header();
            h.record_num -= 1;
            ctx.file.set_header(h);
            Ok(true)
        }
        DelStatus::Deleted => {
            // A single decrement covers this path too (spec.md §9): exactly
            // one record was removed, regardless of which terminal status
            // the recursion bottomed out on.
            let mut h = ctx.file.header();
            h.record_num -= 1;
            h.level = 0;
            h.root_gpid = Gpid::NIL.0;
            ctx.file.set_header(h);
            Ok(true)
        }
    }
}

fn bpt_del(ctx: &mut TreeCtx<'_>, gpid: Gpid, k: u64) -> Result<DelStatus> {
    let pin = ctx.cache.get_page(ctx.file, gpid);
    let is_leaf = PageView::new(pin.bytes_mut()).is_leaf();

    if is_leaf {
        let pos = PageView::new(pin.bytes_mut()).find_key(k);
        let matches = pos >= 0 && PageView::new(pin.bytes_mut()).record(pos as usize).k == k;
        if !matches {
            ctx.cache.put_page(pin);
            return Ok(DelStatus::NotFound);
        }
        PageView::new(pin.bytes_mut()).delete_rec(pos as usize);
        let now_empty = PageView::new(pin.bytes_mut()).record_num() == 0;
        ctx.cache.mark_dirty(&pin);
        ctx.cache.put_page(pin);
        if now_empty {
            ctx.alloc.free_page(ctx.file, gpid);
            log::trace!("btree: freed emptied leaf {gpid:?}");
            return Ok(DelStatus::Deleted);
        }
        return Ok(DelStatus::Ok);
    }

    let pos = PageView::new(pin.bytes_mut()).find_key(k).max(0);
    let child_gpid = Gpid(PageView::new(pin.bytes_mut()).record(pos).v);
    let status = bpt_del(ctx, child_gpid, k)?;
    match status {
        DelStatus::NotFound | DelStatus::Ok => {
            ctx.cache.put_page(pin);
            Ok(status)
        }
        DelStatus::Deleted => {
            PageView::new(pin.bytes_mut()).delete_rec(pos as usize);
            let now_empty = PageView::new(pin.bytes_mut()).record_num() == 0;
            ctx.cache.mark_dirty(&pin);
            ctx.cache.put_page(pin);
            if now_empty {
                ctx.alloc.free_page(ctx.file, gpid);
                log::trace!("btree: freed emptied branch {gpid:?}");
                Ok(DelStatus::Deleted)
            } else {
                Ok(DelStatus::Ok)
            }
        }
    }
}

/// §4.D.6 `get(k)`: iterative descent, since only a leaf's exact match
/// (`FOUND_EXACT`) is a hit — `FOUND_GREATER` and `NOT_FOUND` both mean
/// "absent" from this API's point of view.
pub fn get(ctx: &mut TreeCtx<'_>, k: u64) -> Result<Option<u64>> {
    let header = ctx.file.header();
    if header.level == 0 {
        return Ok(None);
    }
    let mut gpid = Gpid(header.root_gpid);
    loop {
        let pin = ctx.cache.get_page(ctx.file, gpid);
        let view = PageView::new(pin.bytes_mut());
        if view.is_leaf() {
            let pos = view.find_key(k);
            let found = pos >= 0 && view.record(pos as usize).k == k;
            let value = found.then(|| view.record(pos as usize).v);
            ctx.cache.put_page(pin);
            return Ok(value);
        }
        let pos = view.find_key(k).max(0);
        let child = Gpid(view.record(pos).v);
        ctx.cache.put_page(pin);
        gpid = child;
    }
}

/// A forward cursor over a half-open key range `[start_key, end_key)`.
///
/// Holds at most one pinned leaf at a time; callers must route every
/// cursor through [`close_cursor`] to release that pin, even if iteration
/// was abandoned before reaching the end of the range.
pub struct Cursor {
    end_key: u64,
    pin: Option<PagePin>,
    pos: i32,
}

/// §4.D.6 cursor open: binary-search to the leaf that would hold
/// `start_key` and park there. An empty tree yields a cursor with no
/// pinned page.
pub fn open_cursor(ctx: &mut TreeCtx<'_>, start_key: u64, end_key: u64) -> Result<Cursor> {
    let header = ctx.file.header();
    if header.level == 0 {
        return Ok(Cursor { end_key, pin: None, pos: -1 });
    }
    let mut gpid = Gpid(header.root_gpid);
    loop {
        let pin = ctx.cache.get_page(ctx.file, gpid);
        let view = PageView::new(pin.bytes_mut());
        if view.is_leaf() {
            let pos = view.find_key(start_key);
            return Ok(Cursor { end_key, pin: Some(pin), pos });
        }
        let pos = view.find_key(start_key).max(0);
        let child = Gpid(view.record(pos).v);
        ctx.cache.put_page(pin);
        gpid = child;
    }
}

/// §4.D.6 cursor next.
pub fn cursor_next(ctx: &mut TreeCtx<'_>, cursor: &mut Cursor) -> Result<Option<(u64, u64)>> {
    loop {
        let Some(pin) = cursor.pin.as_ref() else {
            return Ok(None);
        };
        let pos = cursor.pos.max(0);
        let view = PageView::new(pin.bytes_mut());

        if pos as usize >= view.record_num() {
            let next_gpid = view.next();
            let old = cursor.pin.take().unwrap();
            ctx.cache.put_page(old);
            if next_gpid.is_nil() {
                cursor.pos = -1;
                return Ok(None);
            }
            let pin = ctx.cache.get_page(ctx.file, next_gpid);
            cursor.pin = Some(pin);
            cursor.pos = 0;
            continue;
        }

        let rec = view.record(pos as usize);
        if rec.k >= cursor.end_key {
            return Ok(None);
        }
        cursor.pos = pos + 1;
        return Ok(Some((rec.k, rec.v)));
    }
}

/// Release the cursor's pinned page, if any. Always call this, including
/// when abandoning iteration early.
pub fn close_cursor(ctx: &mut TreeCtx<'_>, cursor: Cursor) {
    if let Some(pin) = cursor.pin {
        ctx.cache.put_page(pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_ctx() -> (tempfile::TempDir, FileMap, Allocator, PageCache) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        let mut file = FileMap::open(&path).unwrap();
        let alloc = Allocator::init(&mut file).unwrap();
        let cache = PageCache::new();
        (dir, file, alloc, cache)
    }

    #[test]
    fn single_page_tree_s1() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };

        put(&mut ctx, 10, 100).unwrap();
        put(&mut ctx, 5, 50).unwrap();
        put(&mut ctx, 7, 70).unwrap();
        put(&mut ctx, 10, 200).unwrap();

        assert_eq!(ctx.file.header().record_num, 3);
        assert_eq!(ctx.file.header().level, 1);
        assert_eq!(get(&mut ctx, 5).unwrap(), Some(50));
        assert_eq!(get(&mut ctx, 7).unwrap(), Some(70));
        assert_eq!(get(&mut ctx, 10).unwrap(), Some(200));
        assert_eq!(get(&mut ctx, 8).unwrap(), None);

        let mut cur = open_cursor(&mut ctx, 0, u64::MAX).unwrap();
        let mut out = Vec::new();
        while let Some(kv) = cursor_next(&mut ctx, &mut cur).unwrap() {
            out.push(kv);
        }
        close_cursor(&mut ctx, cur);
        assert_eq!(out, vec![(5, 50), (7, 70), (10, 200)]);
    }

    #[test]
    fn leaf_split_s2() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };

        for k in 1u64..=256 {
            put(&mut ctx, k, k * 10).unwrap();
        }

        assert_eq!(ctx.file.header().level, 2);
        assert_eq!(ctx.file.header().record_num, 256);

        let mut cur = open_cursor(&mut ctx, 0, u64::MAX).unwrap();
        let mut out = Vec::new();
        while let Some(kv) = cursor_next(&mut ctx, &mut cur).unwrap() {
            out.push(kv);
        }
        close_cursor(&mut ctx, cur);
        assert_eq!(out.len(), 256);
        for (i, (k, v)) in out.iter().enumerate() {
            assert_eq!(*k, i as u64 + 1);
            assert_eq!(*v, *k * 10);
        }
    }

    #[test]
    fn delete_to_empty_s4() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };

        put(&mut ctx, 10, 100).unwrap();
        put(&mut ctx, 5, 50).unwrap();
        put(&mut ctx, 7, 70).unwrap();

        assert!(del(&mut ctx, 5).unwrap());
        assert!(del(&mut ctx, 7).unwrap());
        assert!(del(&mut ctx, 10).unwrap());

        let h = ctx.file.header();
        assert_eq!(h.record_num, 0);
        assert_eq!(h.level, 0);
        assert_eq!(h.root_gpid, Gpid::NIL.0);
        assert!(h.spare_pages >= 1);
    }

    #[test]
    fn range_cursor_boundary_s5() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };
        for k in [10u64, 20, 30, 40, 50] {
            put(&mut ctx, k, k).unwrap();
        }
        let mut cur = open_cursor(&mut ctx, 20, 40).unwrap();
        let mut out = Vec::new();
        while let Some(kv) = cursor_next(&mut ctx, &mut cur).unwrap() {
            out.push(kv);
        }
        close_cursor(&mut ctx, cur);
        assert_eq!(out, vec![(20, 20), (30, 30)]);
    }

    #[test]
    fn replace_does_not_bump_record_num_s6() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };
        put(&mut ctx, 1, 10).unwrap();
        let after_first = ctx.file.header().record_num;
        put(&mut ctx, 1, 20).unwrap();
        assert_eq!(ctx.file.header().record_num, after_first);
        assert_eq!(get(&mut ctx, 1).unwrap(), Some(20));
    }

    #[test]
    fn get_after_delete_is_not_found() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };
        put(&mut ctx, 42, 99).unwrap();
        del(&mut ctx, 42).unwrap();
        assert_eq!(get(&mut ctx, 42).unwrap(), None);
    }

    #[test]
    fn large_tree_survives_many_inserts() {
        let (_dir, mut file, mut alloc, mut cache) = open_ctx();
        let mut ctx = TreeCtx { file: &mut file, alloc: &mut alloc, cache: &mut cache };
        for k in 1u64..=1000 {
            put(&mut ctx, k, k * 10).unwrap();
        }
        assert_eq!(ctx.file.header().record_num, 1000);
        assert_eq!(get(&mut ctx, 500).unwrap(), Some(5000));
        let mut cur = open_cursor(&mut ctx, 0, u64::MAX).unwrap();
        let mut count = 0;
        while cursor_next(&mut ctx, &mut cur).unwrap().is_some() {
            count += 1;
        }
        close_cursor(&mut ctx, cur);
        assert_eq!(count, 1000);
    }
}
