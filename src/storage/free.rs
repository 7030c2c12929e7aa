//! storage/free — менеджер свободных страниц (под MtxFreePages).
//!
//! Состояние:
//! - free_now            — упорядоченное множество, выдаётся с наименьшего pgno;
//! - bitset              — плотное зеркало free_now; по нему проверяется принадлежность
//!                         (двойное освобождение, выдача страницы, которая уже свободна);
//! - reader_locked       — страницы, освобождённые транзакцией W, которые ещё может
//!                         видеть открытый читатель со снимком < W;
//! - pending_checkpoint  — страницы, на которые ссылается последний durable checkpoint:
//!                         переиспользуются только после следующего checkpoint;
//! - allocated_since_ckpt — страницы, выделенные после снимка последнего checkpoint
//!                         (их нет ни в durable-состоянии, ни в записываемом заголовке);
//!                         сбрасывается в момент снимка (begin_checkpoint), не по его
//!                         завершении: страница, выделенная до снимка, уже в заголовке;
//! - readers             — снимки открытых читателей (txid -> count).
//!
//! Правило продвижения released-страницы, освобождённой транзакцией W:
//!   min(reader snapshot) >= W (или читателей нет)  => дальше,
//!   иначе                                          => reader_locked[W];
//!   allocated_since_ckpt(p) || W <= last_checkpoint_txid => free_now,
//!   иначе                                          => pending_checkpoint.
//! Читатель со снимком s видит дерево транзакции s; страница, освобождённая W,
//! присутствует только в деревьях с txid < W.

use anyhow::Result;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::consts::DB_EOF_PGNO;
use crate::error::KvError;
use crate::metrics::{record_page_alloc, record_pages_promoted, record_pages_released};

/// Плотный bitset по pgno.
#[derive(Debug, Default, Clone)]
pub(crate) struct PageBitset {
    words: Vec<u64>,
    ones: usize,
}

impl PageBitset {
    pub(crate) fn with_capacity(pages: u32) -> Self {
        Self {
            words: vec![0; (pages as usize).div_ceil(64)],
            ones: 0,
        }
    }

    #[inline]
    pub(crate) fn get(&self, pgno: u32) -> bool {
        let (w, b) = ((pgno / 64) as usize, pgno % 64);
        self.words.get(w).map(|x| x & (1u64 << b) != 0).unwrap_or(false)
    }

    pub(crate) fn set(&mut self, pgno: u32) {
        let (w, b) = ((pgno / 64) as usize, pgno % 64);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        if self.words[w] & (1u64 << b) == 0 {
            self.words[w] |= 1u64 << b;
            self.ones += 1;
        }
    }

    pub(crate) fn clear(&mut self, pgno: u32) {
        let (w, b) = ((pgno / 64) as usize, pgno % 64);
        if let Some(x) = self.words.get_mut(w) {
            if *x & (1u64 << b) != 0 {
                *x &= !(1u64 << b);
                self.ones -= 1;
            }
        }
    }

    pub(crate) fn clear_all(&mut self) {
        for w in &mut self.words {
            *w = 0;
        }
        self.ones = 0;
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.ones
    }
}

pub(crate) struct FreePages {
    free_now: BTreeSet<u32>,
    bitset: PageBitset,
    reader_locked: BTreeMap<u64, Vec<u32>>,
    pending_checkpoint: Vec<(u64, u32)>,
    allocated_since_ckpt: PageBitset,
    readers: BTreeMap<u64, usize>,
    page_count: u32,
    last_checkpoint_txid: u64,
}

impl FreePages {
    /// `page_count` — страниц в файле (включая страницу 0), `free` — свободные pgno.
    pub(crate) fn new(page_count: u32, free: impl IntoIterator<Item = u32>, last_checkpoint_txid: u64) -> Self {
        let mut fp = Self {
            free_now: BTreeSet::new(),
            bitset: PageBitset::with_capacity(page_count),
            reader_locked: BTreeMap::new(),
            pending_checkpoint: Vec::new(),
            allocated_since_ckpt: PageBitset::with_capacity(page_count),
            readers: BTreeMap::new(),
            page_count: page_count.max(1),
            last_checkpoint_txid,
        };
        for p in free {
            if p != DB_EOF_PGNO && p < fp.page_count {
                fp.free_now.insert(p);
                fp.bitset.set(p);
            }
        }
        fp
    }

    #[inline]
    pub(crate) fn page_count(&self) -> u32 {
        self.page_count
    }

    pub(crate) fn free_count(&self) -> usize {
        debug_assert_eq!(self.free_now.len(), self.bitset.count());
        self.free_now.len()
    }

    pub(crate) fn reader_locked_count(&self) -> usize {
        self.reader_locked.values().map(|v| v.len()).sum()
    }

    pub(crate) fn pending_checkpoint_count(&self) -> usize {
        self.pending_checkpoint.len()
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.values().sum()
    }

    pub(crate) fn min_reader(&self) -> Option<u64> {
        self.readers.keys().next().copied()
    }

    // ---------- readers ----------

    pub(crate) fn register_reader(&mut self, snapshot: u64) {
        *self.readers.entry(snapshot).or_insert(0) += 1;
    }

    pub(crate) fn unregister_reader(&mut self, snapshot: u64) {
        if let Some(n) = self.readers.get_mut(&snapshot) {
            *n -= 1;
            if *n == 0 {
                self.readers.remove(&snapshot);
            }
        }
        self.promote();
    }

    // ---------- allocation ----------

    /// Взять наименьший свободный pgno; при пустом free_now — попробовать продвинуть
    /// reader_locked. None — нужно расширять файл.
    pub(crate) fn pop_free(&mut self) -> Option<u32> {
        if self.free_now.is_empty() {
            self.promote();
        }
        let p = self.free_now.pop_first()?;
        debug_assert!(self.bitset.get(p), "free_now and bitset diverged at page {}", p);
        self.bitset.clear(p);
        self.allocated_since_ckpt.set(p);
        record_page_alloc(true);
        Some(p)
    }

    /// pgno, который выдаст следующий extend().
    #[inline]
    pub(crate) fn next_extend_pgno(&self) -> u32 {
        self.page_count
    }

    /// Новый pgno за концом файла. Вызывать только когда файл уже вмещает
    /// next_extend_pgno(): page_count попадает в заголовок на checkpoint.
    pub(crate) fn extend(&mut self) -> Result<u32> {
        let p = self.page_count;
        self.page_count = p
            .checked_add(1)
            .ok_or_else(|| anyhow::Error::new(KvError::Mapping("page number space exhausted".into())))?;
        self.allocated_since_ckpt.set(p);
        record_page_alloc(false);
        Ok(p)
    }

    /// Вернуть страницу, которую не видел никто, кроме текущего писателя
    /// (rollback, освобождение в той же транзакции).
    pub(crate) fn add_free(&mut self, pgno: u32) -> Result<()> {
        if pgno == DB_EOF_PGNO || pgno >= self.page_count {
            return Err(KvError::corrupt(format!("free of invalid page {}", pgno)));
        }
        if self.bitset.get(pgno) {
            return Err(KvError::corrupt(format!("double free of page {}", pgno)));
        }
        self.free_now.insert(pgno);
        self.bitset.set(pgno);
        Ok(())
    }

    /// Сделать страницу свободной сейчас. false — она уже была свободна.
    fn make_free(&mut self, pgno: u32) -> bool {
        if self.bitset.get(pgno) {
            return false;
        }
        self.free_now.insert(pgno);
        self.bitset.set(pgno);
        true
    }

    /// Страницы, освобождённые закоммиченной транзакцией `txid`.
    pub(crate) fn release(&mut self, txid: u64, mut pages: Vec<u32>) {
        pages.retain(|&p| {
            let bad = p == DB_EOF_PGNO || p >= self.page_count || self.bitset.get(p);
            if bad {
                warn!("free pages: txid {} released page {} that is not allocated", txid, p);
            }
            !bad
        });
        if pages.is_empty() {
            return;
        }
        record_pages_released(pages.len());
        self.reader_locked.entry(txid).or_default().extend(pages);
        self.promote();
    }

    /// Продвинуть reader_locked -> free_now / pending_checkpoint. Возвращает число
    /// страниц, ставших свободными.
    pub(crate) fn promote(&mut self) -> usize {
        let horizon = self.min_reader();
        let mut freed = 0usize;
        while let Some(w) = self.reader_locked.keys().next().copied() {
            if let Some(m) = horizon {
                if m < w {
                    break;
                }
            }
            let pages = self.reader_locked.remove(&w).unwrap_or_default();
            for p in pages {
                if self.allocated_since_ckpt.get(p) || w <= self.last_checkpoint_txid {
                    if self.make_free(p) {
                        freed += 1;
                    }
                } else {
                    self.pending_checkpoint.push((w, p));
                }
            }
        }
        if freed > 0 {
            record_pages_promoted(freed);
            debug!("free pages: promoted {} (readers horizon {:?})", freed, horizon);
        }
        freed
    }

    /// Снимок корня для checkpoint взят (под этим же MtxFreePages). Всё, что
    /// выделено до него, может попасть в заголовок, поэтому дальше такие
    /// страницы после освобождения ждут следующего checkpoint.
    pub(crate) fn begin_checkpoint(&mut self) {
        self.allocated_since_ckpt.clear_all();
    }

    /// Checkpoint транзакции `txid` стал durable.
    pub(crate) fn on_checkpoint(&mut self, txid: u64) {
        if txid > self.last_checkpoint_txid {
            self.last_checkpoint_txid = txid;
        }
        let mut freed = 0usize;
        let last = self.last_checkpoint_txid;
        let pending = std::mem::take(&mut self.pending_checkpoint);
        for (w, p) in pending {
            if w <= last {
                if self.make_free(p) {
                    freed += 1;
                }
            } else {
                self.pending_checkpoint.push((w, p));
            }
        }
        if freed > 0 {
            record_pages_promoted(freed);
        }
        self.promote();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_first_then_extends() {
        let mut fp = FreePages::new(10, vec![7, 3, 5], 0);
        assert_eq!(fp.pop_free(), Some(3));
        assert_eq!(fp.pop_free(), Some(5));
        assert_eq!(fp.pop_free(), Some(7));
        assert_eq!(fp.pop_free(), None);
        assert_eq!(fp.extend().unwrap(), 10);
        assert_eq!(fp.page_count(), 11);
    }

    #[test]
    fn reader_blocks_reuse_until_closed() {
        let mut fp = FreePages::new(10, Vec::new(), 0);
        // pages 4,5 выделены после checkpoint 0
        fp.allocated_since_ckpt.set(4);
        fp.allocated_since_ckpt.set(5);
        fp.register_reader(1);
        fp.release(2, vec![4, 5]);
        assert_eq!(fp.reader_locked_count(), 2);
        assert_eq!(fp.pop_free(), None);
        fp.unregister_reader(1);
        assert_eq!(fp.reader_locked_count(), 0);
        assert_eq!(fp.pop_free(), Some(4));
    }

    #[test]
    fn reader_at_or_after_release_does_not_block() {
        let mut fp = FreePages::new(10, Vec::new(), 5);
        fp.allocated_since_ckpt.set(2);
        fp.register_reader(6);
        fp.release(6, vec![2]);
        assert!(fp.bitset.get(2));
    }

    #[test]
    fn durable_pages_wait_for_checkpoint() {
        let mut fp = FreePages::new(10, Vec::new(), 1);
        fp.release(3, vec![2]);
        assert_eq!(fp.pending_checkpoint_count(), 1);
        assert!(!fp.bitset.get(2));
        fp.on_checkpoint(2);
        // checkpoint 2 ещё видит страницу (освобождена транзакцией 3)
        assert!(!fp.bitset.get(2));
        fp.on_checkpoint(3);
        assert!(fp.bitset.get(2));
        assert_eq!(fp.pending_checkpoint_count(), 0);
    }

    #[test]
    fn page_from_snapshotted_checkpoint_waits_for_next_one() {
        // checkpoint 5 durable; txn 6 выделяет страницу 10
        let mut fp = FreePages::new(10, Vec::new(), 5);
        assert_eq!(fp.extend().unwrap(), 10);
        // checkpoint снимает корень txn 6 (страница 10 в его дереве) ...
        fp.begin_checkpoint();
        // ... и до записи заголовка txn 7 освобождает её
        fp.release(7, vec![10]);
        assert!(!fp.bitset.get(10));
        assert_eq!(fp.pop_free(), None, "page referenced by the header being written");
        // заголовок 6 записан: он всё ещё ссылается на страницу
        fp.on_checkpoint(6);
        assert!(!fp.bitset.get(10));
        fp.on_checkpoint(7);
        assert_eq!(fp.pop_free(), Some(10));
    }

    #[test]
    fn page_allocated_after_snapshot_is_reused_at_once() {
        let mut fp = FreePages::new(10, Vec::new(), 5);
        fp.begin_checkpoint();
        let p = fp.extend().unwrap();
        fp.release(7, vec![p]);
        assert!(fp.bitset.get(p));
    }

    #[test]
    fn release_of_free_page_is_ignored() {
        let mut fp = FreePages::new(10, vec![4], 0);
        fp.release(1, vec![4, 0, 42]);
        assert_eq!(fp.reader_locked_count(), 0);
        assert_eq!(fp.pending_checkpoint_count(), 0);
        assert_eq!(fp.free_count(), 1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut fp = FreePages::new(10, vec![3], 0);
        assert!(fp.add_free(3).is_err());
        assert!(fp.add_free(0).is_err());
        assert!(fp.add_free(11).is_err());
        assert!(fp.add_free(4).is_ok());
        assert_eq!(fp.free_count(), 2);
    }
}
