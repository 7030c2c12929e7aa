//! map — PagedMap: «таблица» внутри транзакции.
//!
//! PagedMap = имя + корневая страница + политика ключей:
//! - key_size != 0: ключи ровно key_size байт, сравнение memcmp по key_size байтам;
//! - key_size == 0: ключи переменной длины (<= 254), лексикографическое сравнение.
//!
//! Конкретный вариант (BTree | HashTable) выбирается при открытии таблицы и
//! диспетчеризуется через `CursorObj` (см. cursor/). Здесь — общие для всех
//! вариантов примитивы: entry_search и get_data_entry_size.
//!
//! Каталог (main table, имя "") — variable-key BTree: name -> TableData.

pub mod table;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::cmp::Ordering;

use crate::consts::{DB_EOF_PGNO, MAX_TABLE_KEY_SIZE};
use crate::cursor::CursorRegistry;
use crate::error::KvError;
use crate::page::common::{BIGDATA_REF_SIZE, SLOT_SIZE};
use crate::page::entry::leaf_cell_len;
use crate::page::{max_entry_footprint, PageView};

pub use table::DbTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableKind {
    BTree,
    HashTable,
}

impl TableKind {
    fn to_u8(self) -> u8 {
        match self {
            TableKind::BTree => 1,
            TableKind::HashTable => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(TableKind::BTree),
            2 => Ok(TableKind::HashTable),
            other => Err(KvError::corrupt(format!("unknown table kind {}", other))),
        }
    }
}

/// Запись каталога: [kind u8][reserved u8][key_size u16][root u32] (LE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableData {
    pub kind: TableKind,
    pub key_size: usize,
    pub root: u32,
}

pub const TABLE_DATA_SIZE: usize = 8;

impl TableData {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; TABLE_DATA_SIZE];
        b[0] = self.kind.to_u8();
        LittleEndian::write_u16(&mut b[2..4], self.key_size as u16);
        LittleEndian::write_u32(&mut b[4..8], self.root);
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() != TABLE_DATA_SIZE {
            return Err(KvError::corrupt(format!(
                "catalog record has {} bytes, expected {}",
                b.len(),
                TABLE_DATA_SIZE
            )));
        }
        let key_size = LittleEndian::read_u16(&b[2..4]) as usize;
        if key_size > MAX_TABLE_KEY_SIZE {
            return Err(KvError::corrupt(format!("catalog key_size {} too large", key_size)));
        }
        Ok(Self {
            kind: TableKind::from_u8(b[0])?,
            key_size,
            root: LittleEndian::read_u32(&b[4..8]),
        })
    }
}

/// Политика сравнения ключей таблицы.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// memcmp по фиксированному числу байт.
    Binary(usize),
    Lexicographic,
}

impl Comparator {
    pub fn for_key_size(key_size: usize) -> Self {
        if key_size == 0 {
            Comparator::Lexicographic
        } else {
            Comparator::Binary(key_size)
        }
    }

    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match *self {
            Comparator::Binary(n) => a[..n.min(a.len())].cmp(&b[..n.min(b.len())]),
            Comparator::Lexicographic => a.cmp(b),
        }
    }
}

/// Сколько данных записи лежит в странице.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEntrySize {
    /// Inline-данные (для big-data — head fragment).
    pub head: usize,
    pub bigdata: bool,
}

/// Открытая в транзакции таблица.
pub struct PagedMap {
    pub(crate) name: String,
    pub(crate) kind: TableKind,
    pub(crate) key_size: usize,
    pub(crate) root: u32,
    /// Изменена в этой транзакции (запись в каталог при commit).
    pub(crate) dirty: bool,
    pub(crate) dropped: bool,
    pub(crate) cursors: CursorRegistry,
}

impl PagedMap {
    pub(crate) fn new(name: &str, data: TableData) -> Self {
        Self {
            name: name.to_string(),
            kind: data.kind,
            key_size: data.key_size,
            root: data.root,
            dirty: false,
            dropped: false,
            cursors: CursorRegistry::default(),
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

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == DB_EOF_PGNO
    }

    pub(crate) fn table_data(&self) -> TableData {
        TableData {
            kind: self.kind,
            key_size: self.key_size,
            root: self.root,
        }
    }

    #[inline]
    pub fn comparator(&self) -> Comparator {
        Comparator::for_key_size(self.key_size)
    }

    /// Проверка ключа против политики таблицы.
    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        check_key(self.key_size, key)
    }

    pub fn entry_search(&self, page: &PageView<'_>, key: &[u8]) -> Result<(usize, bool)> {
        entry_search(page, key, self.key_size, 0)
    }

    pub fn get_data_entry_size(&self, page_size: usize, key_len: usize, data_len: usize) -> DataEntrySize {
        get_data_entry_size(page_size, self.key_size, key_len, data_len)
    }
}

pub fn check_key(key_size: usize, key: &[u8]) -> Result<()> {
    if key_size == 0 {
        if key.len() > MAX_TABLE_KEY_SIZE {
            return Err(anyhow::Error::new(KvError::KeyTooLarge {
                len: key.len(),
                max: MAX_TABLE_KEY_SIZE,
            }));
        }
    } else if key.len() != key_size {
        return Err(anyhow::Error::new(KvError::KeySizeMismatch {
            expected: key_size,
            got: key.len(),
        }));
    }
    Ok(())
}

/// Бинарный поиск ключа среди записей `[start, count)` страницы.
/// Возвращает (позиция найденной записи или точки вставки, найден ли ключ).
/// Для branch-страниц start = 1: у записи 0 пустой ключ (-inf).
pub fn entry_search(page: &PageView<'_>, key: &[u8], key_size: usize, start: usize) -> Result<(usize, bool)> {
    let cmp = Comparator::for_key_size(key_size);
    let mut lo = start;
    let mut hi = page.count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let k = page.key(mid, key_size)?;
        match cmp.compare(k, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Индекс child’а branch-страницы, под которым лежит `key`.
pub fn branch_child_index(page: &PageView<'_>, key: &[u8], key_size: usize) -> Result<usize> {
    if page.count() == 0 {
        return Err(KvError::corrupt("empty branch page"));
    }
    let (pos, found) = entry_search(page, key, key_size, 1)?;
    Ok(if found { pos } else { pos - 1 })
}

/// Решить, помещается ли значение inline или уходит в big-data цепочку.
pub fn get_data_entry_size(page_size: usize, key_size: usize, key_len: usize, data_len: usize) -> DataEntrySize {
    let budget = max_entry_footprint(page_size);
    let base = leaf_cell_len(key_size, key_len, 0) + SLOT_SIZE;
    if base + data_len <= budget {
        return DataEntrySize {
            head: data_len,
            bigdata: false,
        };
    }
    let head = budget.saturating_sub(base + BIGDATA_REF_SIZE).min(data_len);
    DataEntrySize { head, bigdata: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::entry::{encode_branch, encode_leaf};
    use crate::page::{PageMut, P_BRANCH, P_LEAF};

    #[test]
    fn table_data_roundtrip_and_validation() {
        let td = TableData {
            kind: TableKind::HashTable,
            key_size: 8,
            root: 1234,
        };
        assert_eq!(TableData::decode(&td.encode()).unwrap(), td);
        let mut bad = td.encode();
        bad[0] = 9;
        assert!(TableData::decode(&bad).is_err());
        assert!(TableData::decode(&bad[..4]).is_err());
    }

    #[test]
    fn search_leaf_and_branch() {
        let mut buf = vec![0u8; 4096];
        let mut p = PageMut::new(&mut buf);
        p.init(P_LEAF);
        for (i, k) in [b"b", b"d", b"f"].iter().enumerate() {
            p.insert_cell(i, &encode_leaf(0, *k, 0, b""), 0).unwrap();
        }
        let v = PageView::new(&buf);
        assert_eq!(entry_search(&v, b"d", 0, 0).unwrap(), (1, true));
        assert_eq!(entry_search(&v, b"e", 0, 0).unwrap(), (2, false));
        assert_eq!(entry_search(&v, b"a", 0, 0).unwrap(), (0, false));
        assert_eq!(entry_search(&v, b"z", 0, 0).unwrap(), (3, false));

        let mut bb = vec![0u8; 4096];
        let mut p = PageMut::new(&mut bb);
        p.init(P_BRANCH);
        p.insert_cell(0, &encode_branch(0, b"", 10), 0).unwrap();
        p.insert_cell(1, &encode_branch(0, b"m", 11), 0).unwrap();
        let v = PageView::new(&bb);
        assert_eq!(branch_child_index(&v, b"a", 0).unwrap(), 0);
        assert_eq!(branch_child_index(&v, b"m", 0).unwrap(), 1);
        assert_eq!(branch_child_index(&v, b"zz", 0).unwrap(), 1);
    }

    #[test]
    fn data_entry_size_switches_to_bigdata() {
        let small = get_data_entry_size(4096, 0, 1, 1);
        assert_eq!(small, DataEntrySize { head: 1, bigdata: false });
        let big = get_data_entry_size(4096, 0, 1, 10 * 1024);
        assert!(big.bigdata);
        let cell = leaf_cell_len(0, 1, BIGDATA_REF_SIZE + big.head) + SLOT_SIZE;
        assert!(cell <= max_entry_footprint(4096));
    }

    #[test]
    fn key_checks() {
        assert!(check_key(0, &[1u8; 254]).is_ok());
        let e = check_key(0, &[1u8; 255]).unwrap_err();
        assert!(matches!(KvError::kind_of(&e), Some(KvError::KeyTooLarge { .. })));
        let e = check_key(4, b"abc").unwrap_err();
        assert!(matches!(
            KvError::kind_of(&e),
            Some(KvError::KeySizeMismatch { expected: 4, got: 3 })
        ));
    }
}
