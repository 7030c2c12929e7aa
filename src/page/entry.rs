//! page/entry — кодек ячеек (leaf / branch).
//!
//! Leaf:   [klen u8 — только для variable-key][dflags u8][dsize u32][key][data]
//! Branch: [klen u8 — только для variable-key][child u32][key]
//!
//! key_size == 0 означает variable-length ключи, иначе ключ ровно key_size байт.
//! Для big-data ячейки data = [full u64][tail pgno u32][head fragment], dsize = 12 + head.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::KvError;
use crate::page::common::{BIGDATA_REF_SIZE, BRANCH_CELL_HDR, F_BIGDATA, LEAF_CELL_HDR};

#[inline]
fn klen_prefix(key_size: usize) -> usize {
    if key_size == 0 {
        1
    } else {
        0
    }
}

/// Полный размер leaf-ячейки для ключа длины `klen` и inline-данных `dsize`.
#[inline]
pub fn leaf_cell_len(key_size: usize, klen: usize, dsize: usize) -> usize {
    klen_prefix(key_size) + LEAF_CELL_HDR + klen + dsize
}

#[inline]
pub fn branch_cell_len(key_size: usize, klen: usize) -> usize {
    klen_prefix(key_size) + BRANCH_CELL_HDR + klen
}

/// Разобранная leaf-ячейка (ссылки внутрь буфера страницы).
#[derive(Debug, Clone, Copy)]
pub struct LeafEntry<'a> {
    pub key: &'a [u8],
    pub dflags: u8,
    /// Inline-часть данных (для big-data — ссылка + head fragment).
    pub data: &'a [u8],
}

/// Ссылка на big-data значение.
#[derive(Debug, Clone, Copy)]
pub struct BigRef<'a> {
    /// Полная длина значения.
    pub full: u64,
    /// Первая страница продолжения (0 = продолжения нет).
    pub tail: u32,
    pub head: &'a [u8],
}

impl<'a> LeafEntry<'a> {
    #[inline]
    pub fn is_bigdata(&self) -> bool {
        self.dflags & F_BIGDATA != 0
    }

    pub fn big_ref(&self) -> Result<Option<BigRef<'a>>> {
        if !self.is_bigdata() {
            return Ok(None);
        }
        if self.data.len() < BIGDATA_REF_SIZE {
            return Err(KvError::corrupt("big-data cell shorter than its reference"));
        }
        Ok(Some(BigRef {
            full: LittleEndian::read_u64(&self.data[0..8]),
            tail: LittleEndian::read_u32(&self.data[8..12]),
            head: &self.data[BIGDATA_REF_SIZE..],
        }))
    }

    /// Длина значения (с учётом big-data).
    pub fn value_len(&self) -> Result<u64> {
        Ok(match self.big_ref()? {
            Some(r) => r.full,
            None => self.data.len() as u64,
        })
    }
}

pub fn encode_leaf(key_size: usize, key: &[u8], dflags: u8, data: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(leaf_cell_len(key_size, key.len(), data.len()));
    if key_size == 0 {
        cell.push(key.len() as u8);
    }
    cell.push(dflags);
    let mut b4 = [0u8; 4];
    LittleEndian::write_u32(&mut b4, data.len() as u32);
    cell.extend_from_slice(&b4);
    cell.extend_from_slice(key);
    cell.extend_from_slice(data);
    cell
}

/// Собрать data-часть big-data ячейки.
pub fn encode_bigref(full: u64, tail: u32, head: &[u8]) -> Vec<u8> {
    let mut d = vec![0u8; BIGDATA_REF_SIZE];
    LittleEndian::write_u64(&mut d[0..8], full);
    LittleEndian::write_u32(&mut d[8..12], tail);
    d.extend_from_slice(head);
    d
}

pub fn decode_leaf(cell: &[u8], key_size: usize) -> Result<LeafEntry<'_>> {
    let p = klen_prefix(key_size);
    if cell.len() < p + LEAF_CELL_HDR {
        return Err(KvError::corrupt("leaf cell truncated"));
    }
    let klen = if key_size == 0 { cell[0] as usize } else { key_size };
    let dflags = cell[p];
    let dsize = LittleEndian::read_u32(&cell[p + 1..p + 5]) as usize;
    let kstart = p + LEAF_CELL_HDR;
    if cell.len() < kstart + klen + dsize {
        return Err(KvError::corrupt("leaf cell payload out of bounds"));
    }
    Ok(LeafEntry {
        key: &cell[kstart..kstart + klen],
        dflags,
        data: &cell[kstart + klen..kstart + klen + dsize],
    })
}

pub fn encode_branch(key_size: usize, key: &[u8], child: u32) -> Vec<u8> {
    let mut cell = Vec::with_capacity(branch_cell_len(key_size, key.len().max(key_size)));
    if key_size == 0 {
        cell.push(key.len() as u8);
    }
    let mut b4 = [0u8; 4];
    LittleEndian::write_u32(&mut b4, child);
    cell.extend_from_slice(&b4);
    if key_size == 0 {
        cell.extend_from_slice(key);
    } else {
        // у fixed-key ключ всегда ровно key_size байт; пустой ключ записи 0 — нули
        let mut k = vec![0u8; key_size];
        let n = key.len().min(key_size);
        k[..n].copy_from_slice(&key[..n]);
        cell.extend_from_slice(&k);
    }
    cell
}

pub fn decode_branch(cell: &[u8], key_size: usize) -> Result<(&[u8], u32)> {
    let p = klen_prefix(key_size);
    if cell.len() < p + BRANCH_CELL_HDR {
        return Err(KvError::corrupt("branch cell truncated"));
    }
    let klen = if key_size == 0 { cell[0] as usize } else { key_size };
    let child = LittleEndian::read_u32(&cell[p..p + 4]);
    let kstart = p + BRANCH_CELL_HDR;
    if cell.len() < kstart + klen {
        return Err(KvError::corrupt("branch cell key out of bounds"));
    }
    Ok((&cell[kstart..kstart + klen], child))
}

/// Переписать child в branch-ячейке на месте.
pub fn set_branch_child(cell: &mut [u8], key_size: usize, child: u32) {
    let p = klen_prefix(key_size);
    LittleEndian::write_u32(&mut cell[p..p + 4], child);
}

/// Длина ячейки, начинающейся с `cell[0]`, без полного разбора.
pub fn cell_len(cell: &[u8], is_leaf: bool, key_size: usize) -> Result<usize> {
    let p = klen_prefix(key_size);
    let klen = if key_size == 0 {
        *cell.first().ok_or_else(|| KvError::corrupt("empty cell"))? as usize
    } else {
        key_size
    };
    if is_leaf {
        if cell.len() < p + LEAF_CELL_HDR {
            return Err(KvError::corrupt("leaf cell truncated"));
        }
        let dsize = LittleEndian::read_u32(&cell[p + 1..p + 5]) as usize;
        Ok(p + LEAF_CELL_HDR + klen + dsize)
    } else {
        Ok(p + BRANCH_CELL_HDR + klen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_variable_key() {
        let c = encode_leaf(0, b"key", 0, b"value");
        assert_eq!(c.len(), leaf_cell_len(0, 3, 5));
        let e = decode_leaf(&c, 0).unwrap();
        assert_eq!(e.key, b"key");
        assert_eq!(e.data, b"value");
        assert!(!e.is_bigdata());
        assert_eq!(cell_len(&c, true, 0).unwrap(), c.len());
    }

    #[test]
    fn leaf_bigdata_ref() {
        let d = encode_bigref(10_000, 42, b"head");
        let c = encode_leaf(8, b"12345678", F_BIGDATA, &d);
        let e = decode_leaf(&c, 8).unwrap();
        let r = e.big_ref().unwrap().unwrap();
        assert_eq!(r.full, 10_000);
        assert_eq!(r.tail, 42);
        assert_eq!(r.head, b"head");
        assert_eq!(e.value_len().unwrap(), 10_000);
    }

    #[test]
    fn branch_fixed_key_pads_empty() {
        let c = encode_branch(4, b"", 9);
        assert_eq!(c.len(), branch_cell_len(4, 4));
        let (k, child) = decode_branch(&c, 4).unwrap();
        assert_eq!(k, &[0, 0, 0, 0]);
        assert_eq!(child, 9);
    }

    #[test]
    fn truncated_cell_is_corrupt() {
        let c = encode_leaf(0, b"abc", 0, b"xyz");
        let err = decode_leaf(&c[..6], 0).unwrap_err();
        assert!(matches!(KvError::kind_of(&err), Some(KvError::Corrupt(_))));
    }
}
