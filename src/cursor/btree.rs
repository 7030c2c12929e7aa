//! cursor/btree — B-tree вариант таблицы.
//!
//! Branch-страница: записи (K_i, child_i), K_0 пустой (-inf); ключи поддерева
//! child_i лежат в [K_i, K_{i+1}). Leaf-страницы упорядочены по ключу, связей
//! между соседними leaf нет: переход к соседу идёт через путь от корня
//! (seek_sibling).
//!
//! Вставка: ячейка, не влезшая в страницу, кладётся в overflow и страница
//! делится пополам по байтам; разделитель уходит в родителя (рекурсивно,
//! до нового корня). Разделитель branch-split’а — ключ первой записи правой
//! половины, сама запись остаётся с пустым ключом.
//!
//! Удаление: недогруженная (is_underflowed) не-корневая страница сливается с
//! соседом, если всё помещается в одну страницу; иначе при count < MIN_KEYS
//! записи перераспределяются и разделитель в родителе заменяется. Корень-branch
//! с одним child схлопывается, пустой корень-leaf освобождается.

use anyhow::Result;
use std::collections::HashSet;

use crate::consts::{DB_EOF_PGNO, MIN_KEYS};
use crate::error::KvError;
use crate::map::{branch_child_index, entry_search};
use crate::page::common::SLOT_SIZE;
use crate::page::entry::{decode_branch, decode_leaf, encode_branch};
use crate::page::{usable_space, OverflowCell, PageMut, PageView, P_BRANCH, P_LEAF};
use crate::txn::{PageAlloc, TxnInner};

use super::bigdata::{free_entry_bigdata, insert_imp_head_tail, read_value, walk_chain};
use super::{current_key, CursorObj, CursorState, PageSource, MAX_DEPTH};

pub(crate) struct BTreeCursor;

type Path = Vec<(u32, usize)>;

impl CursorObj for BTreeCursor {
    fn seek_first(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        descend_edge(t, tix, c, false)
    }

    fn seek_last(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        descend_edge(t, tix, c, true)
    }

    fn seek_key(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState, key: &[u8]) -> Result<bool> {
        c.reset();
        let (path, found) = descend(t, tix, key)?;
        if path.is_empty() {
            c.set_eof();
            return Ok(false);
        }
        c.path = path;
        normalize(t, tix, c)?;
        Ok(found)
    }

    fn next(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        if !c.initialized {
            return self.seek_first(t, tix, c);
        }
        if c.eof {
            return Ok(false);
        }
        if c.deleted {
            // после удаления курсор уже стоит на следующей записи
            c.deleted = false;
            return Ok(true);
        }
        step(t, tix, c, true)
    }

    fn prev(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool> {
        if !c.initialized || c.eof {
            return self.seek_last(t, tix, c);
        }
        c.deleted = false;
        step(t, tix, c, false)
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
        let (mut path, found) = descend(t, tix, key)?;
        if found && insert {
            c.reset();
            c.path = path;
            return Ok(false);
        }
        let cell = insert_imp_head_tail(t, ks, key, data)?;
        if path.is_empty() {
            let root = t.alloc(PageAlloc::Leaf)?;
            if !PageMut::new(t.buf_mut(root)?).insert_cell(0, &cell, ks)? {
                return Err(KvError::corrupt("entry does not fit into an empty leaf"));
            }
            t.tables[tix].root = root;
        } else {
            touch_path(t, tix, &mut path)?;
            let level = path.len() - 1;
            let (leaf, idx) = path[level];
            if found {
                free_entry_bigdata(t, leaf, idx, ks)?;
                PageMut::new(t.buf_mut(leaf)?).remove_cell(idx, ks)?;
            }
            insert_at(t, tix, &path, level, idx, cell)?;
        }
        t.tables[tix].dirty = true;
        self.seek_key(t, tix, c, key)?;
        Ok(true)
    }

    fn delete(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()> {
        let ks = t.tables[tix].key_size;
        let key = current_key(t, tix, c)?;
        let mut path = c.path.clone();
        touch_path(t, tix, &mut path)?;
        let level = path.len() - 1;
        let (leaf, idx) = path[level];
        free_entry_bigdata(t, leaf, idx, ks)?;
        PageMut::new(t.buf_mut(leaf)?).remove_cell(idx, ks)?;
        rebalance(t, tix, &path, level)?;
        t.tables[tix].dirty = true;
        self.seek_key(t, tix, c, &key)?;
        c.deleted = true;
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
        let was_deleted = c.deleted;
        let found = self.seek_key(t, tix, c, &key)?;
        c.deleted = was_deleted || !found;
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
        let mut stack = vec![(root, 0usize)];
        while let Some((pg, depth)) = stack.pop() {
            if depth > MAX_DEPTH {
                return Err(KvError::corrupt("b-tree is too deep"));
            }
            visit(pg)?;
            let page = src.load_page(pg)?;
            let v = page.view();
            if v.is_branch() {
                for i in 0..v.count() {
                    stack.push((v.child(i, key_size)?, depth + 1));
                }
            } else if v.is_leaf() {
                for i in 0..v.count() {
                    if let Some(r) = v.leaf(i, key_size)?.big_ref()? {
                        walk_chain(src, r.tail, visit)?;
                    }
                }
            } else {
                return Err(KvError::corrupt(format!(
                    "page {} has unexpected flags {:#x} inside a b-tree",
                    pg,
                    v.flags()
                )));
            }
        }
        Ok(())
    }
}

// ---------- поиск и навигация ----------

/// Спуск к leaf, где лежит (или должен лежать) ключ. Путь без нормализации:
/// индекс в leaf может быть равен count (вставка в конец).
fn descend(t: &TxnInner<'_>, tix: usize, key: &[u8]) -> Result<(Path, bool)> {
    let ks = t.tables[tix].key_size;
    let mut path = Vec::new();
    let mut pg = t.tables[tix].root;
    if pg == DB_EOF_PGNO {
        return Ok((path, false));
    }
    for _ in 0..MAX_DEPTH {
        let page = t.page(pg)?;
        let v = page.view();
        if v.is_branch() {
            let i = branch_child_index(&v, key, ks)?;
            path.push((pg, i));
            pg = v.child(i, ks)?;
        } else if v.is_leaf() {
            let (pos, found) = entry_search(&v, key, ks, 0)?;
            path.push((pg, pos));
            return Ok((path, found));
        } else {
            return Err(KvError::corrupt(format!("page {} is not a b-tree page", pg)));
        }
    }
    Err(KvError::corrupt("b-tree is too deep"))
}

/// Спуск от `pgno` по крайним записям. false — leaf пуст.
fn descend_from(t: &TxnInner<'_>, tix: usize, c: &mut CursorState, pgno: u32, rightmost: bool) -> Result<bool> {
    let ks = t.tables[tix].key_size;
    let mut pg = pgno;
    for _ in 0..MAX_DEPTH {
        let page = t.page(pg)?;
        let v = page.view();
        let n = v.count();
        if v.is_branch() {
            if n == 0 {
                return Err(KvError::corrupt(format!("empty branch page {}", pg)));
            }
            let i = if rightmost { n - 1 } else { 0 };
            c.path.push((pg, i));
            pg = v.child(i, ks)?;
        } else if v.is_leaf() {
            if n == 0 {
                c.path.push((pg, 0));
                return Ok(false);
            }
            c.path.push((pg, if rightmost { n - 1 } else { 0 }));
            return Ok(true);
        } else {
            return Err(KvError::corrupt(format!("page {} is not a b-tree page", pg)));
        }
    }
    Err(KvError::corrupt("b-tree is too deep"))
}

fn descend_edge(t: &TxnInner<'_>, tix: usize, c: &mut CursorState, rightmost: bool) -> Result<bool> {
    c.reset();
    let root = t.tables[tix].root;
    if root == DB_EOF_PGNO || !descend_from(t, tix, c, root, rightmost)? {
        c.set_eof();
        return Ok(false);
    }
    Ok(true)
}

/// Индекс leaf, равный count, переводится на первую запись следующего leaf.
fn normalize(t: &TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()> {
    let Some((pg, idx)) = c.top() else {
        c.set_eof();
        return Ok(());
    };
    let n = t.page(pg)?.view().count();
    if idx < n {
        return Ok(());
    }
    seek_sibling(t, tix, c, true)?;
    Ok(())
}

fn step(t: &TxnInner<'_>, tix: usize, c: &mut CursorState, forward: bool) -> Result<bool> {
    let Some((pg, idx)) = c.top() else {
        c.set_eof();
        return Ok(false);
    };
    let n = t.page(pg)?.view().count();
    let last = c.path.len() - 1;
    if forward && idx + 1 < n {
        c.path[last].1 = idx + 1;
        return Ok(true);
    }
    if !forward && idx > 0 && idx <= n {
        c.path[last].1 = idx - 1;
        return Ok(true);
    }
    seek_sibling(t, tix, c, forward)
}

/// Перейти в соседний leaf (вперёд: первая запись, назад: последняя).
fn seek_sibling(t: &TxnInner<'_>, tix: usize, c: &mut CursorState, forward: bool) -> Result<bool> {
    let ks = t.tables[tix].key_size;
    let mut level = c.path.len().saturating_sub(1);
    while level > 0 {
        level -= 1;
        let (pg, idx) = c.path[level];
        let page = t.page(pg)?;
        let v = page.view();
        let next = if forward {
            (idx + 1 < v.count()).then_some(idx + 1)
        } else {
            idx.checked_sub(1)
        };
        if let Some(ni) = next {
            c.path.truncate(level + 1);
            c.path[level].1 = ni;
            let child = v.child(ni, ks)?;
            if descend_from(t, tix, c, child, !forward)? {
                return Ok(true);
            }
            return Err(KvError::corrupt(format!("empty non-root leaf under page {}", pg)));
        }
    }
    c.set_eof();
    Ok(false)
}

// ---------- изменение дерева ----------

/// Copy-on-write всех страниц пути сверху вниз; ссылки родителей и корень таблицы обновляются.
pub(crate) fn touch_path(t: &mut TxnInner<'_>, tix: usize, path: &mut [(u32, usize)]) -> Result<()> {
    let ks = t.tables[tix].key_size;
    for level in 0..path.len() {
        let old = path[level].0;
        let new = t.touch(old)?;
        if new != old {
            path[level].0 = new;
            if level == 0 {
                t.tables[tix].root = new;
            } else {
                let (parent, pidx) = path[level - 1];
                PageMut::new(t.buf_mut(parent)?).set_child(pidx, new, ks)?;
            }
        }
    }
    t.tables[tix].dirty = true;
    Ok(())
}

fn insert_at(t: &mut TxnInner<'_>, tix: usize, path: &[(u32, usize)], level: usize, idx: usize, cell: Vec<u8>) -> Result<()> {
    let ks = t.tables[tix].key_size;
    let pg = path[level].0;
    if PageMut::new(t.buf_mut(pg)?).insert_cell(idx, &cell, ks)? {
        return Ok(());
    }
    let d = t.page_mut(pg)?;
    if d.ovfl.len() >= 2 {
        return Err(KvError::corrupt(format!("page {} overflow cells exhausted", pg)));
    }
    d.ovfl.push(OverflowCell { index: idx, cell });
    split(t, tix, path, level)
}

/// Точка деления по байтам: обе половины помещаются, разница минимальна.
fn split_point(cells: &[Vec<u8>], page_size: usize) -> Result<usize> {
    let usable = usable_space(page_size);
    let sizes: Vec<usize> = cells.iter().map(|c| c.len() + SLOT_SIZE).collect();
    let total: usize = sizes.iter().sum();
    let mut best: Option<(usize, usize)> = None;
    let mut acc = 0usize;
    for k in 1..cells.len() {
        acc += sizes[k - 1];
        let right = total - acc;
        if acc <= usable && right <= usable {
            let diff = acc.abs_diff(right);
            if best.map_or(true, |(_, d)| diff < d) {
                best = Some((k, diff));
            }
        }
    }
    best.map(|(k, _)| k)
        .ok_or_else(|| KvError::corrupt(format!("no split point for {} cells ({} bytes)", cells.len(), total)))
}

/// Ключ-разделитель правой половины; у branch запись 0 правой половины теряет ключ.
fn take_separator(right: &mut [Vec<u8>], is_leaf: bool, ks: usize) -> Result<Vec<u8>> {
    if is_leaf {
        return Ok(decode_leaf(&right[0], ks)?.key.to_vec());
    }
    let (k0, child) = decode_branch(&right[0], ks)?;
    let sep = k0.to_vec();
    right[0] = encode_branch(ks, &[], child);
    Ok(sep)
}

fn rebuild_page(t: &mut TxnInner<'_>, pg: u32, flags: u8, cells: &[Vec<u8>]) -> Result<()> {
    let refs: Vec<&[u8]> = cells.iter().map(|c| c.as_slice()).collect();
    PageMut::new(t.buf_mut(pg)?).rebuild(flags, 0, &refs)
}

fn collect_cells(t: &TxnInner<'_>, pg: u32, ks: usize) -> Result<(u8, Vec<Vec<u8>>)> {
    let page = t.page(pg)?;
    let v = page.view();
    let cells = v.entries(ks)?.into_iter().map(|c| c.to_vec()).collect();
    Ok((v.flags(), cells))
}

fn split(t: &mut TxnInner<'_>, tix: usize, path: &[(u32, usize)], level: usize) -> Result<()> {
    let ks = t.tables[tix].key_size;
    let ps = t.core.page_size();
    let pg = path[level].0;
    // новые страницы берём до того, как трогать делимую
    let rpg = t.alloc(PageAlloc::Nothing)?;
    let new_root = if level == 0 {
        Some(t.alloc(PageAlloc::Branch)?)
    } else {
        None
    };
    let (flags, cells) = {
        let d = t.page_mut(pg)?;
        let ovfl = std::mem::take(&mut d.ovfl);
        let v = PageView::with_overflow(&d.buf, &ovfl);
        let cells: Vec<Vec<u8>> = v.entries(ks)?.into_iter().map(|c| c.to_vec()).collect();
        (v.flags(), cells)
    };
    let is_leaf = flags & P_LEAF != 0;
    let k = split_point(&cells, ps)?;
    let mut left = cells;
    let mut right = left.split_off(k);
    let sep = take_separator(&mut right, is_leaf, ks)?;

    rebuild_page(t, pg, flags, &left)?;
    rebuild_page(t, rpg, flags, &right)?;
    let sep_cell = encode_branch(ks, &sep, rpg);

    if let Some(root) = new_root {
        let first = encode_branch(ks, &[], pg);
        PageMut::new(t.buf_mut(root)?).rebuild(P_BRANCH, 0, &[&first, &sep_cell])?;
        t.tables[tix].root = root;
        return Ok(());
    }
    let (_, pidx) = path[level - 1];
    insert_at(t, tix, path, level - 1, pidx + 1, sep_cell)
}

fn rebalance(t: &mut TxnInner<'_>, tix: usize, path: &[(u32, usize)], level: usize) -> Result<()> {
    if level == 0 {
        return collapse_root(t, tix);
    }
    let ks = t.tables[tix].key_size;
    let ps = t.core.page_size();
    let pg = path[level].0;
    let (count, underflow) = {
        let page = t.page(pg)?;
        let v = page.view();
        (v.count(), v.is_underflowed(ks)?)
    };
    if !underflow {
        return Ok(());
    }
    let (parent, pidx) = path[level - 1];
    let pcount = t.page(parent)?.view().count();
    if pcount < 2 {
        return Ok(());
    }
    let (li, ri) = if pidx + 1 < pcount { (pidx, pidx + 1) } else { (pidx - 1, pidx) };
    let sib_idx = if li == pidx { ri } else { li };
    let sib = t.page(parent)?.view().child(sib_idx, ks)?;
    let nsib = t.touch(sib)?;
    if nsib != sib {
        PageMut::new(t.buf_mut(parent)?).set_child(sib_idx, nsib, ks)?;
    }
    let (lpg, rpg) = if li == pidx { (pg, nsib) } else { (nsib, pg) };
    let sep = {
        let page = t.page(parent)?;
        let k = page.view().key(ri, ks)?.to_vec();
        k
    };

    let (flags, mut lcells) = collect_cells(t, lpg, ks)?;
    let (_, mut rcells) = collect_cells(t, rpg, ks)?;
    let is_leaf = flags & P_LEAF != 0;
    if !is_leaf {
        // разделитель родителя спускается ключом записи 0 правой страницы
        let (_, child) = decode_branch(&rcells[0], ks)?;
        rcells[0] = encode_branch(ks, &sep, child);
    }
    let total: usize = lcells.iter().chain(rcells.iter()).map(|c| c.len() + SLOT_SIZE).sum();

    if total <= usable_space(ps) {
        lcells.append(&mut rcells);
        rebuild_page(t, lpg, flags, &lcells)?;
        t.free(rpg)?;
        PageMut::new(t.buf_mut(parent)?).remove_cell(ri, ks)?;
        return rebalance(t, tix, path, level - 1);
    }
    if count >= MIN_KEYS {
        return Ok(());
    }

    lcells.append(&mut rcells);
    let k = split_point(&lcells, ps)?;
    let mut right = lcells.split_off(k);
    let nsep = take_separator(&mut right, is_leaf, ks)?;
    rebuild_page(t, lpg, flags, &lcells)?;
    rebuild_page(t, rpg, flags, &right)?;
    PageMut::new(t.buf_mut(parent)?).remove_cell(ri, ks)?;
    insert_at(t, tix, path, level - 1, ri, encode_branch(ks, &nsep, rpg))
}

fn collapse_root(t: &mut TxnInner<'_>, tix: usize) -> Result<()> {
    let ks = t.tables[tix].key_size;
    loop {
        let root = t.tables[tix].root;
        if root == DB_EOF_PGNO {
            return Ok(());
        }
        let (is_branch, is_leaf, count, first_child) = {
            let page = t.page(root)?;
            let v = page.view();
            let child = if v.is_branch() && v.count() == 1 { v.child(0, ks)? } else { DB_EOF_PGNO };
            (v.is_branch(), v.is_leaf(), v.count(), child)
        };
        if is_branch && count == 1 {
            t.free(root)?;
            t.tables[tix].root = first_child;
            continue;
        }
        if is_leaf && count == 0 {
            t.free(root)?;
            t.tables[tix].root = DB_EOF_PGNO;
        }
        return Ok(());
    }
}

// ---------- доступ по ключу без курсора (каталог) ----------

pub(crate) fn get_value(t: &TxnInner<'_>, tix: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let ks = t.tables[tix].key_size;
    let (path, found) = descend(t, tix, key)?;
    if !found {
        return Ok(None);
    }
    let Some(&(pg, idx)) = path.last() else {
        return Ok(None);
    };
    let page = t.page(pg)?;
    let e = page.view().leaf(idx, ks)?;
    read_value(t, &e).map(Some)
}

pub(crate) fn put_value(t: &mut TxnInner<'_>, tix: usize, key: &[u8], data: &[u8]) -> Result<()> {
    let mut c = CursorState::default();
    BTreeCursor.put(t, tix, &mut c, key, data, false)?;
    t.tables[tix].cursors.mark_stale();
    Ok(())
}

pub(crate) fn delete_key(t: &mut TxnInner<'_>, tix: usize, key: &[u8]) -> Result<bool> {
    let mut c = CursorState::default();
    if !BTreeCursor.seek_key(t, tix, &mut c, key)? {
        return Ok(false);
    }
    BTreeCursor.delete(t, tix, &mut c)?;
    t.tables[tix].cursors.mark_stale();
    Ok(true)
}

/// Все ключи дерева по порядку (для списка таблиц каталога).
pub(crate) fn keys(t: &mut TxnInner<'_>, tix: usize) -> Result<Vec<Vec<u8>>> {
    let mut c = CursorState::default();
    let mut out = Vec::new();
    let mut ok = BTreeCursor.seek_first(t, tix, &mut c)?;
    while ok {
        out.push(current_key(t, tix, &c)?);
        ok = BTreeCursor.next(t, tix, &mut c)?;
    }
    Ok(out)
}
