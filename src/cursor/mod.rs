//! cursor — позиция внутри таблицы и операции над ней.
//!
//! Cursor — лёгкий handle: (транзакция, индекс таблицы, id в реестре курсоров).
//! Само состояние (путь от корня до leaf, сохранённый ключ, флаги) живёт в
//! `CursorRegistry` таблицы внутри транзакции, поэтому мутация через один курсор
//! может пометить остальные курсоры этой таблицы как stale. Stale-курсор при
//! следующем обращении заново ищет свой сохранённый ключ от корня:
//! - ключ на месте — позиция восстановлена;
//! - ключа нет (BTree) — курсор стоит на следующей записи с флагом deleted;
//! - ключа нет (HashTable) — курсор уходит в EOF.
//!
//! Варианты таблиц реализуют `CursorObj` (btree.rs, hash.rs); выбор — по
//! `TableKind` при открытии таблицы.

pub mod bigdata;
pub mod btree;
pub mod hash;

use anyhow::Result;

use crate::error::KvError;
use crate::map::{DbTable, TableKind};
use crate::page::Page;
use crate::storage::core::StorageCore;
use crate::txn::{Transaction, TxnInner};

/// Предел глубины обхода (защита от циклов в повреждённом файле).
pub(crate) const MAX_DEPTH: usize = 64;

/// Источник страниц для обходов: транзакция (видит свои грязные копии) или
/// storage напрямую (rebuild free set при открытии).
pub(crate) trait PageSource {
    fn load_page(&self, pgno: u32) -> Result<Page>;
}

impl PageSource for TxnInner<'_> {
    fn load_page(&self, pgno: u32) -> Result<Page> {
        self.page(pgno)
    }
}

impl PageSource for StorageCore {
    fn load_page(&self, pgno: u32) -> Result<Page> {
        self.open_page(pgno)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CursorState {
    /// (pgno, index) от корня до leaf.
    pub(crate) path: Vec<(u32, usize)>,
    /// Ключ текущей записи: по нему курсор восстанавливается после чужих мутаций.
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) initialized: bool,
    pub(crate) eof: bool,
    pub(crate) deleted: bool,
    pub(crate) stale: bool,
}

impl CursorState {
    pub(crate) fn reset(&mut self) {
        self.path.clear();
        self.key = None;
        self.initialized = true;
        self.eof = false;
        self.deleted = false;
    }

    pub(crate) fn set_eof(&mut self) {
        self.path.clear();
        self.key = None;
        self.eof = true;
    }

    #[inline]
    pub(crate) fn top(&self) -> Option<(u32, usize)> {
        self.path.last().copied()
    }

    #[inline]
    pub(crate) fn is_positioned(&self) -> bool {
        self.initialized && !self.eof && !self.deleted && !self.path.is_empty()
    }
}

/// Реестр курсоров таблицы (slab). Слот временно пуст, пока курсор выполняет операцию.
#[derive(Debug, Default)]
pub(crate) struct CursorRegistry {
    slots: Vec<Option<CursorState>>,
    live: Vec<bool>,
    free: Vec<usize>,
}

impl CursorRegistry {
    pub(crate) fn register(&mut self) -> usize {
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(CursorState::default());
            self.live[id] = true;
            return id;
        }
        self.slots.push(Some(CursorState::default()));
        self.live.push(true);
        self.slots.len() - 1
    }

    pub(crate) fn unregister(&mut self, id: usize) {
        if id < self.slots.len() && self.live[id] {
            self.slots[id] = None;
            self.live[id] = false;
            self.free.push(id);
        }
    }

    pub(crate) fn take(&mut self, id: usize) -> Result<CursorState> {
        self.slots
            .get_mut(id)
            .and_then(|s| s.take())
            .ok_or_else(|| KvError::usage("cursor is not registered on this table"))
    }

    pub(crate) fn restore(&mut self, id: usize, st: CursorState) {
        if id < self.slots.len() && self.live[id] {
            self.slots[id] = Some(st);
        }
    }

    /// Пометить stale все курсоры, кроме тех, что сейчас вынуты (выполняют операцию).
    pub(crate) fn mark_stale(&mut self) {
        for s in self.slots.iter_mut().flatten() {
            s.stale = true;
        }
    }
}

/// Операции варианта таблицы над состоянием курсора.
pub(crate) trait CursorObj {
    fn seek_first(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool>;
    fn seek_last(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool>;
    /// Точное совпадение -> true. BTree при промахе встаёт на следующий ключ.
    fn seek_key(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState, key: &[u8]) -> Result<bool>;
    fn next(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool>;
    fn prev(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<bool>;
    /// insert=true: существующий ключ не трогаем и возвращаем false.
    fn put(
        &self,
        t: &mut TxnInner<'_>,
        tix: usize,
        c: &mut CursorState,
        key: &[u8],
        data: &[u8],
        insert: bool,
    ) -> Result<bool>;
    fn delete(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()>;

    fn push_front(
        &self,
        _t: &mut TxnInner<'_>,
        _tix: usize,
        _c: &mut CursorState,
        _key: &[u8],
        _data: &[u8],
    ) -> Result<()> {
        Err(anyhow::Error::new(KvError::NotImplemented("push_front")))
    }

    /// Восстановить позицию после чужой мутации.
    fn relocate(&self, t: &mut TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()>;

    /// Освободить все страницы таблицы.
    fn drop_all(&self, t: &mut TxnInner<'_>, tix: usize) -> Result<()>;

    /// Обойти все страницы таблицы (включая big-data цепочки).
    fn walk_pages(
        &self,
        src: &dyn PageSource,
        root: u32,
        key_size: usize,
        visit: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()>;
}

pub(crate) fn variant(kind: TableKind) -> &'static dyn CursorObj {
    match kind {
        TableKind::BTree => &btree::BTreeCursor,
        TableKind::HashTable => &hash::HashCursor,
    }
}

/// Куда позиционировать курсор в `Cursor::seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPos<'k> {
    First,
    Last,
    Next,
    Prev,
    Key(&'k [u8]),
}

pub struct Cursor<'t, 's> {
    txn: &'t Transaction<'s>,
    tix: usize,
    cid: usize,
}

impl<'t, 's> Cursor<'t, 's> {
    pub fn new(txn: &'t Transaction<'s>, table: &DbTable) -> Result<Self> {
        txn.ensure_active()?;
        let mut inner = txn
            .inner
            .try_borrow_mut()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        let tix = table.index();
        if tix >= inner.tables.len() || inner.tables[tix].name != table.name() {
            return Err(KvError::usage(format!(
                "table '{}' is not open in this transaction",
                table.name()
            )));
        }
        let cid = inner.tables[tix].cursors.register();
        Ok(Self { txn, tix, cid })
    }

    fn run<R>(
        &self,
        write: bool,
        f: impl FnOnce(&dyn CursorObj, &mut TxnInner<'s>, usize, &mut CursorState) -> Result<R>,
    ) -> Result<R> {
        self.txn.ensure_active()?;
        let mut inner = self
            .txn
            .inner
            .try_borrow_mut()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        if write {
            if inner.read_only {
                return Err(anyhow::Error::new(KvError::ReadOnly));
            }
            if inner.tables[self.tix].dropped {
                return Err(KvError::usage(format!(
                    "table '{}' was dropped",
                    inner.tables[self.tix].name
                )));
            }
        }
        let tix = self.tix;
        let mut st = inner.tables[tix].cursors.take(self.cid)?;
        let obj = variant(inner.tables[tix].kind);
        let res = {
            let t: &mut TxnInner<'s> = &mut inner;
            (|| {
                if st.stale {
                    st.stale = false;
                    obj.relocate(t, tix, &mut st)?;
                }
                let r = f(obj, t, tix, &mut st)?;
                sync_key(t, tix, &mut st)?;
                Ok(r)
            })()
        };
        if write {
            inner.tables[tix].cursors.mark_stale();
        }
        inner.tables[tix].cursors.restore(self.cid, st);
        drop(inner);
        if write {
            return self.txn.fail_with(res);
        }
        res
    }

    pub fn seek_first(&self) -> Result<bool> {
        self.run(false, |o, t, tix, c| o.seek_first(t, tix, c))
    }

    pub fn seek_last(&self) -> Result<bool> {
        self.run(false, |o, t, tix, c| o.seek_last(t, tix, c))
    }

    /// true — ключ найден точно. Для BTree при промахе курсор стоит на ближайшем большем ключе.
    pub fn seek_key(&self, key: &[u8]) -> Result<bool> {
        self.run(false, |o, t, tix, c| o.seek_key(t, tix, c, key))
    }

    pub fn seek_next(&self) -> Result<bool> {
        self.run(false, |o, t, tix, c| o.next(t, tix, c))
    }

    pub fn seek_prev(&self) -> Result<bool> {
        self.run(false, |o, t, tix, c| o.prev(t, tix, c))
    }

    pub fn seek(&self, pos: CursorPos<'_>) -> Result<bool> {
        match pos {
            CursorPos::First => self.seek_first(),
            CursorPos::Last => self.seek_last(),
            CursorPos::Next => self.seek_next(),
            CursorPos::Prev => self.seek_prev(),
            CursorPos::Key(k) => self.seek_key(k),
        }
    }

    /// Ключ текущей записи (None — EOF или запись удалена).
    pub fn key(&self) -> Result<Option<Vec<u8>>> {
        self.run(false, |_, t, tix, c| {
            if !c.is_positioned() {
                return Ok(None);
            }
            current_key(t, tix, c).map(Some)
        })
    }

    /// Значение текущей записи целиком (big-data собирается по цепочке).
    pub fn data(&self) -> Result<Option<Vec<u8>>> {
        self.run(false, |_, t, tix, c| {
            if !c.is_positioned() {
                return Ok(None);
            }
            let (pg, idx) = c.top().ok_or_else(|| KvError::corrupt("cursor path is empty"))?;
            let ks = t.tables[tix].key_size;
            let page = t.page(pg)?;
            let e = page.view().leaf(idx, ks)?;
            bigdata::read_value(&*t, &e).map(Some)
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        if self.seek_key(key)? {
            self.data()
        } else {
            Ok(None)
        }
    }

    /// Вставить или обновить. insert=true — не перезаписывать существующий ключ (-> Ok(false)).
    /// После успешного put курсор стоит на записанном ключе.
    pub fn put(&self, key: &[u8], data: &[u8], insert: bool) -> Result<bool> {
        self.check_key(key)?;
        check_value(data)?;
        self.run(true, |o, t, tix, c| o.put(t, tix, c, key, data, insert))
    }

    /// Удалить текущую запись; курсор встаёт на следующую с флагом deleted
    /// (seek_next вернёт её без сдвига).
    pub fn delete(&self) -> Result<()> {
        self.run(true, |o, t, tix, c| {
            if !c.is_positioned() {
                return Err(KvError::usage("cursor is not positioned on an entry"));
            }
            o.delete(t, tix, c)
        })
    }

    pub fn push_front(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_key(key)?;
        check_value(data)?;
        self.run(true, |o, t, tix, c| o.push_front(t, tix, c, key, data))
    }

    /// Удалить таблицу целиком (все страницы освобождаются).
    pub fn drop_table(&self) -> Result<()> {
        self.txn.ensure_active()?;
        let mut inner = self
            .txn
            .inner
            .try_borrow_mut()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        let res = crate::map::table::drop_table_at(&mut inner, self.tix);
        drop(inner);
        self.txn.fail_with(res)
    }

    pub fn is_eof(&self) -> Result<bool> {
        self.run(false, |_, _, _, c| Ok(c.initialized && c.eof))
    }

    pub fn is_deleted(&self) -> Result<bool> {
        self.run(false, |_, _, _, c| Ok(c.deleted))
    }

    pub fn is_initialized(&self) -> Result<bool> {
        self.run(false, |_, _, _, c| Ok(c.initialized))
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let inner = self
            .txn
            .inner
            .try_borrow()
            .map_err(|_| KvError::usage("transaction is busy"))?;
        inner.tables[self.tix].check_key(key)
    }
}

impl Drop for Cursor<'_, '_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.txn.inner.try_borrow_mut() {
            if let Some(t) = inner.tables.get_mut(self.tix) {
                t.cursors.unregister(self.cid);
            }
        }
    }
}

fn check_value(data: &[u8]) -> Result<()> {
    if data.len() as u64 > u32::MAX as u64 {
        return Err(KvError::usage(format!("value too large: {} bytes", data.len())));
    }
    Ok(())
}

pub(crate) fn current_key(t: &TxnInner<'_>, tix: usize, c: &CursorState) -> Result<Vec<u8>> {
    let (pg, idx) = c.top().ok_or_else(|| KvError::corrupt("cursor path is empty"))?;
    let page = t.page(pg)?;
    let key = page.view().leaf(idx, t.tables[tix].key_size)?.key.to_vec();
    Ok(key)
}

/// Запомнить ключ текущей позиции (для восстановления после чужих мутаций).
fn sync_key(t: &TxnInner<'_>, tix: usize, c: &mut CursorState) -> Result<()> {
    if !c.initialized || c.eof || c.path.is_empty() {
        c.key = None;
        return Ok(());
    }
    c.key = Some(current_key(t, tix, c)?);
    Ok(())
}
