//! txn — транзакции (read-only / read-write).
//!
//! Читатель: снимок (main_root, txid) берётся под MtxFreePages и регистрируется
//! в free-менеджере; пока читатель жив, страницы, освобождённые более поздними
//! транзакциями, не переиспользуются. Ничего общего читатель не меняет.
//!
//! Писатель: держит MtxWrite от begin до commit/rollback. Все изменения идут в
//! heap-копии страниц (dirty), выделенные страницы копятся в `allocated`,
//! освобождённые чужие — в `released`.
//!
//! Commit:
//! 1) записи каталога для изменённых таблиц;
//! 2) запись dirty-страниц в файл (на новые pgno, старый корень не трогается);
//! 3) атомарная замена корня под MtxRoot, txid += 1;
//! 4) released -> free-менеджер (правило читателей);
//! 5) checkpoint: всегда при durability, иначе по checkpoint_period (не для bulk).
//! Ошибка до шага 3 откатывает транзакцию. Ошибка checkpoint после публикации
//! возвращается вызывающему, коммит уже виден.

pub mod alloc;

use anyhow::Result;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};

use crate::consts::MAIN_TABLE_NAME;
use crate::error::KvError;
use crate::map::{PagedMap, TableData, TableKind};
use crate::metrics::{record_commit, record_rollback};
use crate::page::{OverflowCell, Page};
use crate::storage::core::{lock, StorageCore};

pub use alloc::PageAlloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

/// Грязная страница транзакции записи.
pub(crate) struct DirtyPage {
    pub(crate) buf: Arc<Vec<u8>>,
    /// Ячейки, ждущие split (не больше двух).
    pub(crate) ovfl: Vec<OverflowCell>,
}

pub(crate) struct TxnInner<'s> {
    pub(crate) core: &'s StorageCore,
    pub(crate) read_only: bool,
    pub(crate) dirty: HashMap<u32, DirtyPage>,
    pub(crate) allocated: HashSet<u32>,
    pub(crate) released: Vec<u32>,
    /// Открытые таблицы; [0] — каталог.
    pub(crate) tables: Vec<PagedMap>,
    pub(crate) table_ix: HashMap<String, usize>,
}

impl<'s> TxnInner<'s> {
    fn new(core: &'s StorageCore, read_only: bool, main_root: u32) -> Self {
        let catalog = PagedMap::new(
            MAIN_TABLE_NAME,
            TableData {
                kind: TableKind::BTree,
                key_size: 0,
                root: main_root,
            },
        );
        let mut table_ix = HashMap::new();
        table_ix.insert(MAIN_TABLE_NAME.to_string(), 0);
        Self {
            core,
            read_only,
            dirty: HashMap::new(),
            allocated: HashSet::new(),
            released: Vec::new(),
            tables: vec![catalog],
            table_ix,
        }
    }

    /// Страница в представлении этой транзакции (своя грязная копия или committed).
    pub(crate) fn page(&self, pgno: u32) -> Result<Page> {
        if let Some(d) = self.dirty.get(&pgno) {
            return Ok(Page::heap(pgno, Arc::clone(&d.buf)));
        }
        self.core.open_page(pgno)
    }

    pub(crate) fn page_mut(&mut self, pgno: u32) -> Result<&mut DirtyPage> {
        self.dirty
            .get_mut(&pgno)
            .ok_or_else(|| KvError::corrupt(format!("page {} is not writable in this transaction", pgno)))
    }

    pub(crate) fn buf_mut(&mut self, pgno: u32) -> Result<&mut [u8]> {
        let d = self.page_mut(pgno)?;
        Ok(Arc::make_mut(&mut d.buf).as_mut_slice())
    }

    #[inline]
    pub(crate) fn main_root(&self) -> u32 {
        self.tables[0].root
    }

    /// Записать в каталог изменённые таблицы.
    fn flush_tables(&mut self) -> Result<()> {
        for ix in 1..self.tables.len() {
            if !self.tables[ix].dirty {
                continue;
            }
            let name = self.tables[ix].name.clone();
            if self.tables[ix].dropped {
                crate::cursor::btree::delete_key(self, 0, name.as_bytes())?;
            } else {
                let rec = self.tables[ix].table_data().encode();
                crate::cursor::btree::put_value(self, 0, name.as_bytes(), &rec)?;
            }
            self.tables[ix].dirty = false;
        }
        Ok(())
    }

    /// Вернуть всё выделенное в free set (страницы никто, кроме нас, не видел).
    fn discard(&mut self) {
        let mut n = 0usize;
        for p in self.allocated.drain() {
            if let Err(e) = self.core.free_unpublished(p) {
                warn!("rollback: cannot return page {}: {:#}", p, e);
            }
            n += 1;
        }
        self.dirty.clear();
        self.released.clear();
        if n > 0 {
            debug!("rollback: returned {} pages", n);
        }
    }
}

pub struct Transaction<'s> {
    core: &'s StorageCore,
    read_only: bool,
    bulk: bool,
    snapshot_txid: u64,
    pub(crate) inner: RefCell<TxnInner<'s>>,
    status: Cell<TxnStatus>,
    _write_guard: Option<MutexGuard<'s, ()>>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn begin(core: &'s StorageCore, read_only: bool, bulk: bool) -> Result<Self> {
        if !read_only && core.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        let (guard, main_root, txid) = if read_only {
            let (root, txid) = core.begin_reader()?;
            (None, root, txid)
        } else {
            let g = lock(&core.mtx_write, "MtxWrite")?;
            let (root, txid) = core.snapshot_root()?;
            (Some(g), root, txid)
        };
        core.txn_started();
        Ok(Self {
            core,
            read_only,
            bulk,
            snapshot_txid: txid,
            inner: RefCell::new(TxnInner::new(core, read_only, main_root)),
            status: Cell::new(TxnStatus::Active),
            _write_guard: guard,
        })
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn is_bulk(&self) -> bool {
        self.bulk
    }

    /// txid снимка, на котором открыта транзакция.
    #[inline]
    pub fn snapshot_txid(&self) -> u64 {
        self.snapshot_txid
    }

    #[inline]
    pub fn status(&self) -> TxnStatus {
        self.status.get()
    }

    pub fn page_size(&self) -> usize {
        self.core.page_size()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.status.get() != TxnStatus::Active {
            return Err(KvError::usage(format!(
                "transaction is {:?}",
                self.status.get()
            )));
        }
        Ok(())
    }

    /// Имена пользовательских таблиц в снимке транзакции (по возрастанию).
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        let mut inner = self
            .inner
            .try_borrow_mut()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        crate::map::table::list_tables(&mut inner)
    }

    pub fn commit(self) -> Result<()> {
        self.ensure_active()?;
        if self.read_only {
            self.status.set(TxnStatus::Committed);
            return Ok(());
        }
        let published = match self.publish() {
            Ok(p) => p,
            Err(e) => {
                warn!("commit failed, rolling back: {:#}", e);
                self.rollback_inner();
                return Err(e);
            }
        };
        self.status.set(TxnStatus::Committed);
        let Some(txid) = published else {
            return Ok(());
        };
        record_commit();
        if self.core.cfg.durability || (!self.bulk && self.core.checkpoint_due()) {
            self.core.checkpoint()?;
        }
        debug!("commit txid={}", txid);
        Ok(())
    }

    /// Шаги 1–4 коммита. None — транзакция ничего не меняла.
    fn publish(&self) -> Result<Option<u64>> {
        let mut inner = self
            .inner
            .try_borrow_mut()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        inner.flush_tables()?;
        if inner.dirty.is_empty() && inner.released.is_empty() {
            return Ok(None);
        }
        let mut pgnos: Vec<u32> = inner.dirty.keys().copied().collect();
        pgnos.sort_unstable();
        for p in pgnos {
            let d = &inner.dirty[&p];
            if !d.ovfl.is_empty() {
                return Err(KvError::corrupt(format!("page {} has unsplit overflow cells", p)));
            }
            self.core.write_page(p, &d.buf)?;
        }
        let released = std::mem::take(&mut inner.released);
        let txid = self.core.publish(inner.main_root(), released)?;
        inner.dirty.clear();
        inner.allocated.clear();
        Ok(Some(txid))
    }

    pub fn rollback(self) -> Result<()> {
        self.ensure_active()?;
        if !self.read_only {
            self.rollback_inner();
        } else {
            self.status.set(TxnStatus::RolledBack);
        }
        Ok(())
    }

    /// Откатить пишущую транзакцию после сбоя посреди записи.
    /// Ошибки предусловий транзакцию не трогают: до них ничего не менялось.
    pub(crate) fn fail_with<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if !self.read_only
                && self.status.get() == TxnStatus::Active
                && !KvError::is_precondition(e)
            {
                warn!("txn {}: write failed, rolling back: {:#}", self.snapshot_txid, e);
                self.rollback_inner();
            }
        }
        res
    }

    fn rollback_inner(&self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.discard();
        }
        self.status.set(TxnStatus::RolledBack);
        record_rollback();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status.get() == TxnStatus::Active {
            if self.read_only {
                self.status.set(TxnStatus::RolledBack);
            } else {
                self.rollback_inner();
            }
        }
        if self.read_only {
            self.core.end_reader(self.snapshot_txid);
        }
        self.core.txn_finished();
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("read_only", &self.read_only)
            .field("bulk", &self.bulk)
            .field("snapshot_txid", &self.snapshot_txid)
            .field("status", &self.status.get())
            .finish()
    }
}
