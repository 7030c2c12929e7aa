//! map/table — DbTable: имя таблицы, привязанное к корню и политике ключей.
//!
//! Таблицы открываются лениво и кэшируются в транзакции до её конца.
//! Каталог (main table) хранит name -> TableData; запись в каталог
//! происходит при commit (только для изменённых таблиц).

use anyhow::Result;

use crate::consts::{DB_EOF_PGNO, MAIN_TABLE_NAME, MAX_TABLE_KEY_SIZE};
use crate::cursor::{btree, variant, Cursor};
use crate::error::KvError;
use crate::txn::{Transaction, TxnInner};

use super::{PagedMap, TableData, TableKind};

/// Описание открытой в транзакции таблицы (handle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTable {
    name: String,
    kind: TableKind,
    key_size: usize,
    index: usize,
}

impl DbTable {
    /// Открыть таблицу, создав её при отсутствии (нужна транзакция записи).
    /// Существующая таблица должна совпадать по kind и key_size.
    pub fn open(txn: &Transaction<'_>, name: &str, kind: TableKind, key_size: usize) -> Result<Self> {
        validate_name(name)?;
        if key_size > MAX_TABLE_KEY_SIZE {
            return Err(anyhow::Error::new(KvError::KeyTooLarge {
                len: key_size,
                max: MAX_TABLE_KEY_SIZE,
            }));
        }
        let mut inner = borrow(txn)?;
        let ix = open_table(&mut inner, name, Some((kind, key_size)), true)?
            .ok_or_else(|| KvError::usage(format!("table '{}' not found", name)))?;
        Ok(Self::describe(&inner, ix))
    }

    /// Открыть существующую таблицу. None — такой таблицы нет.
    pub fn open_existing(txn: &Transaction<'_>, name: &str) -> Result<Option<Self>> {
        validate_name(name)?;
        let mut inner = borrow(txn)?;
        Ok(open_table(&mut inner, name, None, false)?.map(|ix| Self::describe(&inner, ix)))
    }

    /// Каталог таблиц (имя -> TableData), variable-key BTree.
    pub fn main(txn: &Transaction<'_>) -> Result<Self> {
        let inner = borrow(txn)?;
        Ok(Self::describe(&inner, 0))
    }

    /// Удалить таблицу. false — таблицы не было.
    pub fn drop(txn: &Transaction<'_>, name: &str) -> Result<bool> {
        validate_name(name)?;
        let mut inner = borrow(txn)?;
        let Some(ix) = open_table(&mut inner, name, None, false)? else {
            return Ok(false);
        };
        let res = drop_table_at(&mut inner, ix);
        drop(inner);
        txn.fail_with(res).map(|()| true)
    }

    fn describe(inner: &TxnInner<'_>, ix: usize) -> Self {
        let t = &inner.tables[ix];
        Self {
            name: t.name.clone(),
            kind: t.kind,
            key_size: t.key_size,
            index: ix,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub fn cursor<'t, 's>(&self, txn: &'t Transaction<'s>) -> Result<Cursor<'t, 's>> {
        Cursor::new(txn, self)
    }

    /// Вставить или обновить запись.
    pub fn put(&self, txn: &Transaction<'_>, key: &[u8], data: &[u8]) -> Result<()> {
        self.cursor(txn)?.put(key, data, false)?;
        Ok(())
    }

    /// Вставить, только если ключа нет. false — ключ уже был.
    pub fn insert(&self, txn: &Transaction<'_>, key: &[u8], data: &[u8]) -> Result<bool> {
        self.cursor(txn)?.put(key, data, true)
    }

    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.cursor(txn)?.get(key)
    }

    /// Удалить запись. false — ключа не было.
    pub fn delete(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<bool> {
        let c = self.cursor(txn)?;
        if !c.seek_key(key)? {
            return Ok(false);
        }
        c.delete()?;
        Ok(true)
    }

    pub fn push_front(&self, txn: &Transaction<'_>, key: &[u8], data: &[u8]) -> Result<()> {
        self.cursor(txn)?.push_front(key, data)
    }

    /// Текущая запись каталога (корень таблицы в снимке транзакции).
    pub fn table_data(&self, txn: &Transaction<'_>) -> Result<TableData> {
        let inner = borrow(txn)?;
        Ok(inner.tables[self.index].table_data())
    }
}

fn borrow<'a, 's>(txn: &'a Transaction<'s>) -> Result<std::cell::RefMut<'a, TxnInner<'s>>> {
    txn.ensure_active()?;
    txn.inner
        .try_borrow_mut()
        .map_err(|_| KvError::usage("transaction is busy"))
}

fn validate_name(name: &str) -> Result<()> {
    if name == MAIN_TABLE_NAME {
        return Err(KvError::usage("table name must not be empty"));
    }
    if name.len() > MAX_TABLE_KEY_SIZE {
        return Err(anyhow::Error::new(KvError::KeyTooLarge {
            len: name.len(),
            max: MAX_TABLE_KEY_SIZE,
        }));
    }
    Ok(())
}

fn check_shape(name: &str, have: (TableKind, usize), want: Option<(TableKind, usize)>) -> Result<()> {
    let Some((kind, ks)) = want else {
        return Ok(());
    };
    if have.0 != kind {
        return Err(KvError::usage(format!(
            "table '{}' is a {:?}, not a {:?}",
            name, have.0, kind
        )));
    }
    if have.1 != ks {
        return Err(anyhow::Error::new(KvError::KeySizeMismatch {
            expected: have.1,
            got: ks,
        }));
    }
    Ok(())
}

/// Индекс таблицы в транзакции; при необходимости читает каталог или создаёт таблицу.
pub(crate) fn open_table(
    t: &mut TxnInner<'_>,
    name: &str,
    shape: Option<(TableKind, usize)>,
    create: bool,
) -> Result<Option<usize>> {
    if let Some(&ix) = t.table_ix.get(name) {
        let tbl = &mut t.tables[ix];
        if !tbl.dropped {
            check_shape(name, (tbl.kind, tbl.key_size), shape)?;
            return Ok(Some(ix));
        }
        if !create {
            return Ok(None);
        }
        // пересоздание в той же транзакции, где таблицу удалили
        let (kind, ks) = shape.unwrap_or((TableKind::BTree, 0));
        tbl.kind = kind;
        tbl.key_size = ks;
        tbl.root = DB_EOF_PGNO;
        tbl.dropped = false;
        tbl.dirty = true;
        tbl.cursors.mark_stale();
        return Ok(Some(ix));
    }

    let rec = btree::get_value(t, 0, name.as_bytes())?;
    let map = match rec {
        Some(bytes) => {
            let td = TableData::decode(&bytes)?;
            check_shape(name, (td.kind, td.key_size), shape)?;
            PagedMap::new(name, td)
        }
        None => {
            if !create {
                return Ok(None);
            }
            if t.read_only {
                return Err(anyhow::Error::new(KvError::ReadOnly));
            }
            let (kind, key_size) = shape.unwrap_or((TableKind::BTree, 0));
            let mut m = PagedMap::new(
                name,
                TableData {
                    kind,
                    key_size,
                    root: DB_EOF_PGNO,
                },
            );
            m.dirty = true;
            m
        }
    };
    t.tables.push(map);
    let ix = t.tables.len() - 1;
    t.table_ix.insert(name.to_string(), ix);
    Ok(Some(ix))
}

/// Освободить все страницы таблицы и пометить её удалённой.
pub(crate) fn drop_table_at(t: &mut TxnInner<'_>, ix: usize) -> Result<()> {
    if t.read_only {
        return Err(anyhow::Error::new(KvError::ReadOnly));
    }
    if ix == 0 {
        return Err(KvError::usage("the catalog table cannot be dropped"));
    }
    if t.tables[ix].dropped {
        return Ok(());
    }
    variant(t.tables[ix].kind).drop_all(t, ix)?;
    let tbl = &mut t.tables[ix];
    tbl.root = DB_EOF_PGNO;
    tbl.dropped = true;
    tbl.dirty = true;
    tbl.cursors.mark_stale();
    Ok(())
}

/// Имена таблиц: каталог снимка + созданные/удалённые в этой транзакции.
pub(crate) fn list_tables(t: &mut TxnInner<'_>) -> Result<Vec<String>> {
    let mut names: Vec<String> = btree::keys(t, 0)?
        .into_iter()
        .map(|k| String::from_utf8_lossy(&k).into_owned())
        .collect();
    for tbl in t.tables.iter().skip(1) {
        if !tbl.dirty {
            continue;
        }
        if tbl.dropped {
            names.retain(|n| n != &tbl.name);
        } else if !names.contains(&tbl.name) {
            names.push(tbl.name.clone());
        }
    }
    names.sort();
    Ok(names)
}
