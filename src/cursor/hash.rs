//! cursor/hash — hash-table вариант таблицы.
//!
//! Корень — страница-директория (P_HASHDIR) с головами бакетов (u32 pgno).
//! Бакет — цепочка leaf-страниц через link; внутри страницы записи отсортированы,
//! пустых страниц в цепочке не бывает (опустевшая страница вынимается).
//! Бакет ключа — xxhash64(key) % buckets.
//!
//! put ищет ключ по всей цепочке и вставляет в первую страницу с местом (или
//! новой головой). push_front смотрит только голову: дубликат в более старых
//! страницах не ищется, поиск всегда идёт с головы и видит новую запись первой.
//!
//! Путь курсора: [(dir, bucket), (chain page, idx)...]; значим idx последнего.
//! Обход идёт в порядке бакетов, не ключей.

use anyhow::Result;
use std::collections::HashSet;

use crate::consts::DB_EOF_PGNO;
use crate::error::KvError;
use crate::hash::bucket_of_key;
use crate::map::entry_search;
use crate::page::common::{HASH_BUCKET_SIZE, PAGE_HDR_SIZE, SLOT_SIZE};
use crate::page::PageMut;
use crate::txn::{PageAlloc, TxnInner};

use super::bigdata::{free_entry_bigdata, insert_imp_head_tail, walk_chain};
use super::{CursorObj, CursorState, PageSource};

pub(crate) struct HashCursor;

type Path = Vec<(u32, usize)>;

#[inline]
pub(crate) fn dir_buckets(page_size: usize) -> usize {
    (page_size - PAGE_HDR_SIZE) / HASH_BUCKET_SIZE
}

/// Предел длины цепочки: страниц в файле.
fn chain_limit(t: &TxnInner<'_>) -> Result<u64> {
    Ok(t.core.file_len()? / t.core.page_size() as u64 + 1)
}

fn bucket_head(t: &TxnInner<'_>, dir: u32, b: usize) -> Result<u32> {
    let page = t.page(dir)?;
    let v = page.view();
    if !v.is_hashdir() {
        return Err(KvError::corrupt(format!("page {} is not a hash directory", dir)));
    }
    v.hash_bucket(b)
}

fn bucket_count(t: &TxnInner<'_>, dir: u32) -> Result<usize> {
    let page = t.page(dir)?;
    let v = page.view();
    if !v.is_hashdir() {
        return Err(KvError::corrupt(format!("page {} is not a hash directory", dir)));
    }
    Ok(v.num())
}

/// Путь к первому вхождению ключа (с головы цепочки).
fn find(t: &TxnInner<'_>, tix: usize, key: &[u8]) -> Result<Option<Path>> {
    let ks = t.tables[tix].key_size;
    let dir = t.tables[tix].root;
    if dir == DB_EOF_PGNO {
        return Ok(None);
    }
    let b = bucket_of_key(key, bucket_count(t, dir)?);
    let mut path = vec![(dir, b)];
    let mut pg = bucket_head(t, dir, b)?;
    let limit = chain_limit(t)?;
    let mut steps = 0u64;
    while pg != DB_EOF_PGNO {
        steps += 1;
        if steps > limit {
            return Err(KvError::corrupt(format!("hash bucket {} chain loops", b)));
        }
        let page = t.page(pg)?;
        let v = page.view();
        if !v.is_leaf() {
            return Err(KvError::corrupt(format!("page {} in bucket chain is not a leaf", pg)));
        }
        let (pos, found) = entry_search(&v, key, ks, 0)?;
        if found {
            path.push((pg, pos));
            return Ok(Some(path));
        }
        path.push((pg, 0));
        pg = v.link();
    }
    Ok(None)
}

/// Встать на первую (forward) или последнюю запись первого непустого бакета,
/// начиная с `from` в направлении обхода.
fn scan_buckets(t: &TxnInner<'_>, tix: usize, c: &mut CursorState, from: Option<usize>, forward: bool) -> Result<bool> {
    let dir = t.tables[tix].root;
    c.path.clear();
    let Some(from) = from else {
        c.set_eof();
        return Ok(false);
    };
    if dir == DB_EOF_PGNO {
        c.set_eof();
        return Ok(false);
    }
    let n = bucket_count(t, dir)?;
    let mut b = from;
    while b < n {
        let head = bucket_head(t, dir, b)?;
        if head != DB_EOF_PGNO {
            c.path.push((dir, b));
            if forward {
                c.path.push((head, 0));
            } else {
                walk_to_tail(t, c, head)?;
            }
            return Ok(true);
        }
        if forward {
            b += 1;
        } else if b == 0 {
            break;
        } else {
            b -= 1;
        }
    }
    c.set_eof();
    Ok(false)
}

fn walk_to_tail(t: &TxnInner<'_>, c: &mut CursorState, head: u32) -> Result<()> {
    let limit = chain_limit(t)?;
    let mut pg = head;
    let mut steps = 0u64;
    loop {
        steps += 1;
        if steps > limit {
            return Err(KvError::corrupt("hash bucket chain loops"));
        }
        let page = t.page(pg)?;
        let v = page.view();
        let n = v.count();
        if n == 0 {
            return Err(KvError::corrupt(format!("empty page {} in bucket chain", pg)));
        }
        let link = v.link();
        if link == DB_EOF_PGNO {
            c.path.push((pg, n - 1));
            return Ok(());
        }
        c.path.push((pg, 0));
        pg = link;
    }
}

/// Создать директорию, если таблица пуста.
fn ensure_dir(t: &mut TxnInner<'_>, tix: usize) -> Result<u32> {
    let root = t.tables[tix].root;
    if root != DB_EOF_PGNO {
        return Ok(root);
    }
    let n = dir_buckets(t.core.page_size());
    let dir = t.alloc(PageAlloc::Zero)?;
    PageMut::new(t.buf_mut(dir)?).init_hashdir(n);
    t.tables[tix].root = dir;
    t.tables[tix].dirty = true;
    Ok(dir)
}

/// Copy-on-write директории и первых `upto + 1` страниц цепочки бакета `b`.
/// Возвращает (dir, новые pgno страниц цепочки).
fn touch_chain(t: &mut TxnInner<'_>, tix: usize, b: usize, upto: Option<usize>) -> Result<(u32, Vec<u32>)> {
    let root = t.tables[tix].root;
    let dir = t.touch(root)?;
    if dir != root {
        t.tables[tix].root = dir;
    }
    t.tables[tix].dirty = true;
    let mut pages = Vec::new();
    let Some(upto) = upto else {
        return Ok((dir, pages));
    };
    let mut pg = bucket_head(t, dir, b)?;
    let mut prev: Option<u32> = None;
    for _ in 0..=upto {
        if pg == DB_EOF_PGNO {
            return Err(KvError::corrupt(format!("bucket {} chain is shorter than expected", b)));
        }
        let npg = t.touch(pg)?;
        if npg != pg {
            match prev {
                None => PageMut::new(t.buf_mut(dir)?).set_hash_bucket(b, npg)?,
                Some(p) => PageMut::new(t.buf_mut(p)?).set_link(npg),
            }
        }
        pages.push(npg);
        prev = Some(npg);
        pg = t.page(npg)?.view().link();
    }
    Ok((dir, pages))
}

/// Новая голова бакета с одной ячейкой.
fn push_head(t: &mut TxnInner<'_>, tix: usize, b: usize, cell: &[u8]) -> Result<()> {
    let ks = t.tables[tix].key_size;
    let (dir, _) = touch_chain(t, tix, b, None)?;
    let old = bucket_head(t, dir, b)?;
    let np = t.alloc(PageAlloc::Leaf)?;
    {
        let mut pm = PageMut::new(t.buf_mut(np)?);
        pm.set_link(old);
        if !pm.insert_cell(0, cell, ks)? {
            return Err(KvError::corrupt("entry does not fit into an empty leaf"));
        }
    }
    PageMut::new(t.buf_mut(dir)?).set_hash_bucket(b, np)
}

/// Вставить ячейку в первую страницу цепочки, где есть место, иначе — новой головой.
fn insert_into_bucket(t: &mut TxnInner<'_>, tix: usize, key: &[u8], cell: &[u8]) -> Result<()> {
    let ks = t.tables[tix].key_size;
    let dir = t.tables[tix].root;
    let b = bucket_of_key(key, bucket_count(t, dir)?);
    let limit = chain_limit(t)?;
    let mut pg = bucket_head(t, dir, b)?;
    let mut i = 0usize;
    let mut target = None;
    while pg != DB_EOF_PGNO {
        if i as u64 > limit {
            return Err(KvError::corrupt(format!("hash bucket {} chain loops", b)));
        }
        let page = t.page(pg)?;
        let v = page.view();
        if v.free_bytes() >= cell.len() + SLOT_SIZE {
            target = Some(i);
            break;
        }
        pg = v.link();
        i += 1;
    }
    let Some(i) = target else {
        return push_head(t, tix, b, cell);
    };
    let (_, pages) = touch_chain(t, tix, b, Some(i))?;
    let p = pages[i];
    let pos = {
        let page = t.page(p)?;
        let (pos, _) = entry_search(&page.view(), key, ks, 0)?;
        pos
    };
    if !PageMut::new(t.buf_mut(p)?).insert_cell(pos, cell, ks)? {
        return Err(KvError::corrupt(format!("page {} has no room after free space check", p)));
    }
    Ok(())
}

/// Удаление записи `idx` со страницы номер `i` цепочки бакета `b`.
struct Removed {
    dir: u32,
    pages: Vec<u32>,
    unlinked: bool,
    link: u32,
}

fn remove_entry(t: &mut TxnInner<'_>, tix: usize, b: usize, i: usize, idx: usize) -> Result<Removed> {
    let ks = t.tables[tix].key_size;
    let (dir, pages) = touch_chain(t, tix, b, Some(i))?;
    let pg = pages[i];
    free_entry_bigdata(t, pg, idx, ks)?;
    PageMut::new(t.buf_mut(pg)?).remove_cell(idx, ks)?;
    let (count, link) = {
        let page = t.page(pg)?;
        let v = page.view();
        (v.count(), v.link())
    };
    if count > 0 {
        return Ok(Removed {
            dir,
            pages,
            unlinked: false,
            link,
        });
    }
    if i == 0 {
        PageMut::new(t.buf_mut(dir)?).set_hash_bucket(b, link)?;
    } else {
        PageMut::new(t.buf_mut(pages[i - 1])?).set_link(link);
    }
    t.free(pg)?;
    Ok(Removed {
        dir,
        pages,
        unlinked: true,
        link,
    })
}

impl CursorObj for HashCursor {
    fn seek_first(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        c.reset();
        scan_buckets(t, tix, c, Some(0), true)
    }

    fn seek_last(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        c.reset();
        let dir = t.tables[tix].root;
        if dir == DB_EOF_PGNO {
            c.set_eof();
            return Ok(false);
        }
        let n = bucket_count(t, dir)?;
        scan_buckets(t, tix, c, n.checked_sub(1), false)
    }

    fn seek_key(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState, key: &[u8]) -> Result<bool> {
        c.reset();
        match find(t, tix, key)? {
            Some(path) => {
                c.path = path;
                Ok(true)
            }
            None => {
                c.set_eof();
                Ok(false)
            }
        }
    }

    fn next(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        if !c.initialized {
            return self.seek_first(t, tix, c);
        }
        if c.eof {
            return Ok(false);
        }
        if c.deleted {
            c.deleted = false;
            return Ok(true);
        }
        let Some((pg, idx)) = c.top() else {
            c.set_eof();
            return Ok(false);
        };
        let (n, link) = {
            let page = t.page(pg)?;
            let v = page.view();
            (v.count(), v.link())
        };
        let last = c.path.len() - 1;
        if idx + 1 < n {
            c.path[last].1 = idx + 1;
            return Ok(true);
        }
        if link != DB_EOF_PGNO {
            c.path[last].1 = 0;
            c.path.push((link, 0));
            return Ok(true);
        }
        let b = c.path[0].1;
        scan_buckets(t, tix, c, Some(b + 1), true)
    }

    fn prev(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        if !c.initialized || c.eof {
            return self.seek_last(t, tix, c);
        }
        c.deleted = false;
        let Some((_, idx)) = c.top() else {
            c.set_eof();
            return Ok(false);
        };
        let last = c.path.len() - 1;
        if idx > 0 {
            c.path[last].1 = idx - 1;
            return Ok(true);
        }
        if c.path.len() > 2 {
            c.path.pop();
            let (pg, _) = c.path[c.path.len() - 1];
            let n = t.page(pg)?.view().count();
            let l = c.path.len() - 1;
            c.path[l].1 = n.saturating_sub(1);
            return Ok(true);
        }
        let b = c.path[0].1;
        scan_buckets(t, tix, c, b.checked_sub(1), false)
    }

    fn put(
        &self,
        t: &mut TxnInner<'_>,
        tix: usize,
        c: &mut CursorState,
        key: &[u8],
        data: &[u8],
        insert: bool,
    ) -> Result<bool> {
        let ks = t.tables[tix].key_size;
        ensure_dir(t, tix)?;
        if let Some(path) = find(t, tix, key)? {
            if insert {
                c.reset();
                c.path = path;
                return Ok(false);
            }
            let b = path[0].1;
            let (_, idx) = path[path.len() - 1];
            remove_entry(t, tix, b, path.len() - 2, idx)?;
        }
        let cell = insert_imp_head_tail(t, ks, key, data)?;
        insert_into_bucket(t, tix, key, &cell)?;
        t.tables[tix].dirty = true;
        self.seek_key(t, tix, c, key)?;
        Ok(true)
    }

    fn delete(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()> {
        let Some((_, idx)) = c.top() else {
            return Err(KvError::usage("cursor is not positioned on an entry"));
        };
        if c.path.len() < 2 {
            return Err(KvError::corrupt("hash cursor path is too short"));
        }
        let b = c.path[0].1;
        let i = c.path.len() - 2;
        let r = remove_entry(t, tix, b, i, idx)?;
        t.tables[tix].dirty = true;

        c.path.clear();
        c.path.push((r.dir, b));
        let keep = if r.unlinked { i } else { i + 1 };
        for &p in &r.pages[..keep] {
            c.path.push((p, 0));
        }
        let positioned = if !r.unlinked {
            let n = t.page(r.pages[i])?.view().count();
            if idx < n {
                let l = c.path.len() - 1;
                c.path[l].1 = idx;
                true
            } else if r.link != DB_EOF_PGNO {
                c.path.push((r.link, 0));
                true
            } else {
                scan_buckets(t, tix, c, Some(b + 1), true)?
            }
        } else if r.link != DB_EOF_PGNO {
            c.path.push((r.link, 0));
            true
        } else {
            scan_buckets(t, tix, c, Some(b + 1), true)?
        };
        if !positioned {
            c.set_eof();
        }
        c.deleted = true;
        Ok(())
    }

    fn push_front(
        &self,
        t: &mut TxnInner<'_>,
        tix: usize,
        c: &mut CursorState,
        key: &[u8],
        data: &[u8],
    ) -> Result<()> {
        let ks = t.tables[tix].key_size;
        let dir = ensure_dir(t, tix)?;
        let b = bucket_of_key(key, bucket_count(t, dir)?);
        let cell = insert_imp_head_tail(t, ks, key, data)?;
        let head = bucket_head(t, dir, b)?;
        let placed = if head == DB_EOF_PGNO {
            false
        } else {
            let (pos, found, room) = {
                let page = t.page(head)?;
                let v = page.view();
                let (pos, found) = entry_search(&v, key, ks, 0)?;
                (pos, found, v.free_bytes())
            };
            if found {
                let (_, pages) = touch_chain(t, tix, b, Some(0))?;
                let hp = pages[0];
                free_entry_bigdata(t, hp, pos, ks)?;
                let mut pm = PageMut::new(t.buf_mut(hp)?);
                pm.remove_cell(pos, ks)?;
                pm.insert_cell(pos, &cell, ks)?
            } else if room >= cell.len() + SLOT_SIZE {
                let (_, pages) = touch_chain(t, tix, b, Some(0))?;
                PageMut::new(t.buf_mut(pages[0])?).insert_cell(pos, &cell, ks)?
            } else {
                false
            }
        };
        if !placed {
            push_head(t, tix, b, &cell)?;
        }
        t.tables[tix].dirty = true;
        self.seek_key(t, tix, c, key)?;
        Ok(())
    }

    fn relocate(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()> {
        if !c.initialized || c.eof {
            c.path.clear();
            return Ok(());
        }
        let Some(key) = c.key.clone() else {
            c.set_eof();
            return Ok(());
        };
        match find(t, tix, &key)? {
            Some(path) => c.path = path,
            None => {
                c.set_eof();
                c.deleted = true;
            }
        }
        Ok(())
    }

    fn drop_all(&self, t: &mut TxnInner<'_>, tix: usize) -> Result<()> {
        let root = t.tables[tix].root;
        let ks = t.tables[tix].key_size;
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        self.walk_pages(&*t, root, ks, &mut |p| {
            if !seen.insert(p) {
                return Err(KvError::corrupt(format!("page {} referenced twice", p)));
            }
            pages.push(p);
            Ok(())
        })?;
        for p in pages {
            t.free(p)?;
        }
        t.tables[tix].root = DB_EOF_PGNO;
        t.tables[tix].dirty = true;
        Ok(())
    }

    fn walk_pages(
        &self,
        src: &dyn PageSource,
        root: u32,
        key_size: usize,
        visit: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        if root == DB_EOF_PGNO {
            return Ok(());
        }
        visit(root)?;
        let dpage = src.load_page(root)?;
        let dv = dpage.view();
        if !dv.is_hashdir() {
            return Err(KvError::corrupt(format!("page {} is not a hash directory", root)));
        }
        for b in 0..dv.num() {
            let mut pg = dv.hash_bucket(b)?;
            while pg != DB_EOF_PGNO {
                visit(pg)?;
                let page = src.load_page(pg)?;
                let v = page.view();
                if !v.is_leaf() {
                    return Err(KvError::corrupt(format!("page {} in bucket chain is not a leaf", pg)));
                }
                for i in 0..v.count() {
                    if let Some(r) = v.leaf(i, key_size)?.big_ref()? {
                        walk_chain(src, r.tail, visit)?;
                    }
                }
                pg = v.link();
            }
        }
        Ok(())
    }
}

