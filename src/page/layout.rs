//! page/layout — типизированные представления страницы поверх байтов.
//!
//! PageView — только чтение: layout-запросы (entries, size_left, fill_percent,
//! is_underflowed) без какой-либо политики. PageMut — примитивы изменения
//! (вставка/удаление ячейки, compaction, пересборка), которыми пользуются
//! слои таблиц и курсоров. Каждое обращение к ячейке проверяется по границам.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{MIN_KEYS, UNDERFLOW_FILL_PERCENT};
use crate::error::KvError;
use crate::page::common::*;
use crate::page::entry::{self, LeafEntry};

/// Ячейка, которая временно не поместилась в страницу (ждёт split).
#[derive(Debug, Clone)]
pub struct OverflowCell {
    /// Логическая позиция среди записей страницы.
    pub index: usize,
    pub cell: Vec<u8>,
}

/// Максимальная «стоимость» одной записи (ячейка + слот) для страницы.
/// Гарантирует, что при split каждая половина получает не меньше MIN_KEYS записей.
#[inline]
pub fn max_entry_footprint(page_size: usize) -> usize {
    (page_size - PAGE_HDR_SIZE) / (2 * MIN_KEYS + 1)
}

#[inline]
pub fn usable_space(page_size: usize) -> usize {
    page_size - PAGE_HDR_SIZE
}

#[derive(Clone, Copy)]
pub struct PageView<'a> {
    buf: &'a [u8],
    ovfl: &'a [OverflowCell],
}

impl<'a> PageView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, ovfl: &[] }
    }

    pub fn with_overflow(buf: &'a [u8], ovfl: &'a [OverflowCell]) -> Self {
        Self { buf, ovfl }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.buf.len()
    }
    #[inline]
    pub fn flags(&self) -> u8 {
        self.buf[OFF_FLAGS]
    }
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags() & P_LEAF != 0
    }
    #[inline]
    pub fn is_branch(&self) -> bool {
        self.flags() & P_BRANCH != 0
    }
    #[inline]
    pub fn is_bigdata(&self) -> bool {
        self.flags() & P_BIGDATA != 0
    }
    #[inline]
    pub fn is_hashdir(&self) -> bool {
        self.flags() & P_HASHDIR != 0
    }
    /// Физическое число записей (без overflow-ячеек).
    #[inline]
    pub fn num(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_NUM..OFF_NUM + 2]) as usize
    }
    /// Логическое число записей (с overflow-ячейками).
    #[inline]
    pub fn count(&self) -> usize {
        self.num() + self.ovfl.len()
    }
    #[inline]
    pub fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_LOWER..OFF_LOWER + 2]) as usize
    }
    #[inline]
    pub fn upper(&self) -> usize {
        let u = LittleEndian::read_u16(&self.buf[OFF_UPPER..OFF_UPPER + 2]) as usize;
        // 0 в upper у страницы 32 KiB не бывает, но пустой буфер трактуем как «конец страницы»
        if u == 0 {
            self.buf.len()
        } else {
            u
        }
    }
    #[inline]
    pub fn link(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[OFF_LINK..OFF_LINK + 4])
    }
    #[inline]
    pub fn frag(&self) -> usize {
        LittleEndian::read_u32(&self.buf[OFF_FRAG..OFF_FRAG + 4]) as usize
    }
    pub fn overflow_cells(&self) -> &'a [OverflowCell] {
        self.ovfl
    }

    fn slot(&self, i: usize) -> Result<usize> {
        if i >= self.num() {
            return Err(KvError::corrupt(format!(
                "slot {} out of range (num={})",
                i,
                self.num()
            )));
        }
        let at = PAGE_HDR_SIZE + i * SLOT_SIZE;
        if at + SLOT_SIZE > self.buf.len() {
            return Err(KvError::corrupt("slot array beyond page end"));
        }
        Ok(LittleEndian::read_u16(&self.buf[at..at + SLOT_SIZE]) as usize)
    }

    /// Физическая ячейка `i` (без overflow).
    pub fn cell(&self, i: usize, key_size: usize) -> Result<&'a [u8]> {
        let off = self.slot(i)?;
        let min = PAGE_HDR_SIZE + self.num() * SLOT_SIZE;
        if off < min || off >= self.buf.len() {
            return Err(KvError::corrupt(format!("cell offset {} out of page bounds", off)));
        }
        let len = entry::cell_len(&self.buf[off..], self.is_leaf(), key_size)?;
        if off + len > self.buf.len() {
            return Err(KvError::corrupt(format!(
                "cell {} [{}..{}) exceeds page size {}",
                i,
                off,
                off + len,
                self.buf.len()
            )));
        }
        Ok(&self.buf[off..off + len])
    }

    /// Логическая запись `i` с учётом overflow-ячеек.
    pub fn entry(&self, i: usize, key_size: usize) -> Result<&'a [u8]> {
        if self.ovfl.is_empty() {
            return self.cell(i, key_size);
        }
        let mut shift = 0usize;
        for o in self.ovfl {
            if o.index == i {
                return Ok(&o.cell);
            }
            if o.index < i {
                shift += 1;
            }
        }
        self.cell(i - shift, key_size)
    }

    /// Все записи в логическом порядке (overflow-ячейки на своих местах).
    pub fn entries(&self, key_size: usize) -> Result<Vec<&'a [u8]>> {
        let total = self.count();
        let mut out = Vec::with_capacity(total);
        let mut phys = 0usize;
        let mut oi = 0usize;
        for logical in 0..total {
            if oi < self.ovfl.len() && self.ovfl[oi].index == logical {
                out.push(&self.ovfl[oi].cell[..]);
                oi += 1;
            } else {
                out.push(self.cell(phys, key_size)?);
                phys += 1;
            }
        }
        Ok(out)
    }

    pub fn leaf(&self, i: usize, key_size: usize) -> Result<LeafEntry<'a>> {
        entry::decode_leaf(self.entry(i, key_size)?, key_size)
    }

    pub fn branch(&self, i: usize, key_size: usize) -> Result<(&'a [u8], u32)> {
        entry::decode_branch(self.entry(i, key_size)?, key_size)
    }

    pub fn key(&self, i: usize, key_size: usize) -> Result<&'a [u8]> {
        if self.is_leaf() {
            Ok(self.leaf(i, key_size)?.key)
        } else {
            Ok(self.branch(i, key_size)?.0)
        }
    }

    pub fn child(&self, i: usize, key_size: usize) -> Result<u32> {
        Ok(self.branch(i, key_size)?.1)
    }

    /// Занято: ячейки + слоты (включая overflow).
    pub fn used_bytes(&self, key_size: usize) -> Result<usize> {
        let mut used = 0usize;
        for c in self.entries(key_size)? {
            used += c.len() + SLOT_SIZE;
        }
        Ok(used)
    }

    /// Свободно после compaction (непрерывная дыра + фрагменты).
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.upper().saturating_sub(self.lower()) + self.frag()
    }

    /// Сколько байт ключа+данных поместится в новую запись данного типа ключей.
    pub fn size_left(&self, key_size: usize) -> usize {
        let hdr = if self.is_leaf() {
            entry::leaf_cell_len(key_size, 0, 0)
        } else {
            entry::branch_cell_len(key_size, 0)
        };
        self.free_bytes().saturating_sub(SLOT_SIZE + hdr)
    }

    pub fn fill_percent(&self, key_size: usize) -> Result<usize> {
        Ok(self.used_bytes(key_size)? * 100 / usable_space(self.page_size()))
    }

    pub fn is_underflowed(&self, key_size: usize) -> Result<bool> {
        Ok(self.count() < MIN_KEYS || self.fill_percent(key_size)? < UNDERFLOW_FILL_PERCENT)
    }

    // ---------- big-data / hash directory ----------

    pub fn bigdata_payload(&self) -> Result<&'a [u8]> {
        if !self.is_bigdata() {
            return Err(KvError::corrupt("not a big-data page"));
        }
        let len = self.lower();
        if PAGE_HDR_SIZE + len > self.buf.len() {
            return Err(KvError::corrupt("big-data payload exceeds page"));
        }
        Ok(&self.buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + len])
    }

    pub fn hash_bucket(&self, i: usize) -> Result<u32> {
        if i >= self.num() {
            return Err(KvError::corrupt(format!("bucket {} out of range", i)));
        }
        let at = PAGE_HDR_SIZE + i * HASH_BUCKET_SIZE;
        Ok(LittleEndian::read_u32(&self.buf[at..at + 4]))
    }
}

pub struct PageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(self.buf)
    }

    /// Пустая страница данного типа.
    pub fn init(&mut self, flags: u8) {
        let ps = self.buf.len();
        for b in &mut self.buf[..PAGE_HDR_SIZE] {
            *b = 0;
        }
        self.buf[OFF_FLAGS] = flags;
        self.set_u16(OFF_LOWER, PAGE_HDR_SIZE);
        self.set_u16(OFF_UPPER, ps);
    }

    fn set_u16(&mut self, off: usize, v: usize) {
        LittleEndian::write_u16(&mut self.buf[off..off + 2], v as u16);
    }

    fn set_num(&mut self, n: usize) {
        self.set_u16(OFF_NUM, n);
    }

    fn set_frag(&mut self, v: usize) {
        LittleEndian::write_u32(&mut self.buf[OFF_FRAG..OFF_FRAG + 4], v as u32);
    }

    pub fn set_link(&mut self, link: u32) {
        LittleEndian::write_u32(&mut self.buf[OFF_LINK..OFF_LINK + 4], link);
    }

    /// Вставить ячейку на позицию `idx`. Ok(false) — места нет даже после compaction.
    pub fn insert_cell(&mut self, idx: usize, cell: &[u8], key_size: usize) -> Result<bool> {
        let (num, lower, upper, frag) = {
            let v = self.view();
            (v.num(), v.lower(), v.upper(), v.frag())
        };
        if idx > num {
            return Err(KvError::corrupt(format!("insert index {} > num {}", idx, num)));
        }
        let need = cell.len() + SLOT_SIZE;
        if upper.saturating_sub(lower) < need {
            if upper.saturating_sub(lower) + frag < need {
                return Ok(false);
            }
            self.compact(key_size)?;
        }
        let (lower, upper) = {
            let v = self.view();
            (v.lower(), v.upper())
        };
        let s = PAGE_HDR_SIZE + idx * SLOT_SIZE;
        self.buf.copy_within(s..lower, s + SLOT_SIZE);
        let off = upper - cell.len();
        self.buf[off..upper].copy_from_slice(cell);
        self.set_u16(s, off);
        self.set_num(num + 1);
        self.set_u16(OFF_LOWER, lower + SLOT_SIZE);
        self.set_u16(OFF_UPPER, off);
        Ok(true)
    }

    pub fn remove_cell(&mut self, idx: usize, key_size: usize) -> Result<()> {
        let (num, lower, upper, frag, off, len) = {
            let v = self.view();
            let c = v.cell(idx, key_size)?;
            let off = LittleEndian::read_u16(
                &self.buf[PAGE_HDR_SIZE + idx * SLOT_SIZE..PAGE_HDR_SIZE + idx * SLOT_SIZE + 2],
            ) as usize;
            (v.num(), v.lower(), v.upper(), v.frag(), off, c.len())
        };
        if off == upper {
            self.set_u16(OFF_UPPER, upper + len);
        } else {
            self.set_frag(frag + len);
        }
        let s = PAGE_HDR_SIZE + idx * SLOT_SIZE;
        self.buf.copy_within(s + SLOT_SIZE..lower, s);
        self.set_num(num - 1);
        self.set_u16(OFF_LOWER, lower - SLOT_SIZE);
        Ok(())
    }

    /// Собрать ячейки плотно у конца страницы.
    pub fn compact(&mut self, key_size: usize) -> Result<()> {
        let (flags, link, cells) = {
            let v = self.view();
            let cells: Vec<Vec<u8>> = v
                .entries(key_size)?
                .into_iter()
                .map(|c| c.to_vec())
                .collect();
            (v.flags(), v.link(), cells)
        };
        let refs: Vec<&[u8]> = cells.iter().map(|c| c.as_slice()).collect();
        self.rebuild(flags, link, &refs)
    }

    /// Переписать страницу целиком из списка ячеек (должны поместиться).
    pub fn rebuild(&mut self, flags: u8, link: u32, cells: &[&[u8]]) -> Result<()> {
        let ps = self.buf.len();
        let need: usize = cells.iter().map(|c| c.len() + SLOT_SIZE).sum();
        if need > usable_space(ps) {
            return Err(KvError::corrupt(format!(
                "rebuild: {} bytes do not fit into page of {}",
                need, ps
            )));
        }
        self.init(flags);
        self.set_link(link);
        let mut upper = ps;
        for (i, c) in cells.iter().enumerate() {
            upper -= c.len();
            self.buf[upper..upper + c.len()].copy_from_slice(c);
            self.set_u16(PAGE_HDR_SIZE + i * SLOT_SIZE, upper);
        }
        self.set_num(cells.len());
        self.set_u16(OFF_LOWER, PAGE_HDR_SIZE + cells.len() * SLOT_SIZE);
        self.set_u16(OFF_UPPER, upper);
        Ok(())
    }

    /// Переписать child branch-записи `idx` на месте.
    pub fn set_child(&mut self, idx: usize, child: u32, key_size: usize) -> Result<()> {
        let off = {
            let v = self.view();
            if !v.is_branch() {
                return Err(KvError::corrupt("set_child on a non-branch page"));
            }
            v.cell(idx, key_size)?;
            LittleEndian::read_u16(
                &self.buf[PAGE_HDR_SIZE + idx * SLOT_SIZE..PAGE_HDR_SIZE + idx * SLOT_SIZE + 2],
            ) as usize
        };
        entry::set_branch_child(&mut self.buf[off..], key_size, child);
        Ok(())
    }

    // ---------- big-data / hash directory ----------

    pub fn write_bigdata(&mut self, payload: &[u8], link: u32) -> Result<()> {
        if PAGE_HDR_SIZE + payload.len() > self.buf.len() {
            return Err(KvError::usage("big-data payload larger than page capacity"));
        }
        self.init(P_BIGDATA);
        self.set_link(link);
        self.set_u16(OFF_LOWER, payload.len());
        self.buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    pub fn init_hashdir(&mut self, buckets: usize) {
        self.init(P_HASHDIR);
        self.set_num(buckets);
        for b in &mut self.buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + buckets * HASH_BUCKET_SIZE] {
            *b = 0;
        }
    }

    pub fn set_hash_bucket(&mut self, i: usize, head: u32) -> Result<()> {
        if i >= self.view().num() {
            return Err(KvError::corrupt(format!("bucket {} out of range", i)));
        }
        let at = PAGE_HDR_SIZE + i * HASH_BUCKET_SIZE;
        LittleEndian::write_u32(&mut self.buf[at..at + 4], head);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::entry::{encode_branch, encode_leaf};

    fn leaf_page(ps: usize) -> Vec<u8> {
        let mut buf = vec![0u8; ps];
        PageMut::new(&mut buf).init(P_LEAF);
        buf
    }

    #[test]
    fn insert_keeps_slot_order() {
        let mut buf = leaf_page(4096);
        let mut p = PageMut::new(&mut buf);
        assert!(p.insert_cell(0, &encode_leaf(0, b"b", 0, b"2"), 0).unwrap());
        assert!(p.insert_cell(0, &encode_leaf(0, b"a", 0, b"1"), 0).unwrap());
        assert!(p.insert_cell(2, &encode_leaf(0, b"c", 0, b"3"), 0).unwrap());
        let v = PageView::new(&buf);
        let keys: Vec<&[u8]> = (0..v.num()).map(|i| v.key(i, 0).unwrap()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c"]);
    }

    #[test]
    fn remove_then_reuse_fragment_space() {
        let mut buf = leaf_page(4096);
        let big = vec![7u8; 400];
        let mut n = 0;
        loop {
            let key = format!("k{:03}", n);
            let c = encode_leaf(0, key.as_bytes(), 0, &big);
            if !PageMut::new(&mut buf).insert_cell(n, &c, 0).unwrap() {
                break;
            }
            n += 1;
        }
        assert!(n >= 9);
        // удалим из середины — место появится только как фрагмент
        PageMut::new(&mut buf).remove_cell(n / 2, 0).unwrap();
        assert!(PageView::new(&buf).frag() > 0);
        let c = encode_leaf(0, b"zzzz", 0, &big);
        assert!(PageMut::new(&mut buf).insert_cell(n - 1, &c, 0).unwrap());
        let v = PageView::new(&buf);
        assert_eq!(v.num(), n);
        assert_eq!(v.key(n - 1, 0).unwrap(), b"zzzz");
    }

    #[test]
    fn overflow_cells_merge_logically() {
        let mut buf = leaf_page(4096);
        let mut p = PageMut::new(&mut buf);
        p.insert_cell(0, &encode_leaf(4, b"aaaa", 0, b""), 4).unwrap();
        p.insert_cell(1, &encode_leaf(4, b"cccc", 0, b""), 4).unwrap();
        let ov = vec![OverflowCell {
            index: 1,
            cell: encode_leaf(4, b"bbbb", 0, b""),
        }];
        let v = PageView::with_overflow(&buf, &ov);
        assert_eq!(v.count(), 3);
        assert_eq!(v.key(1, 4).unwrap(), b"bbbb");
        assert_eq!(v.key(2, 4).unwrap(), b"cccc");
    }

    #[test]
    fn underflow_and_fill() {
        let mut buf = vec![0u8; 4096];
        let mut p = PageMut::new(&mut buf);
        p.init(P_BRANCH);
        for i in 0..3u32 {
            p.insert_cell(i as usize, &encode_branch(0, &[i as u8], i + 1), 0)
                .unwrap();
        }
        let v = PageView::new(&buf);
        assert!(v.is_underflowed(0).unwrap());
        assert_eq!(v.child(2, 0).unwrap(), 3);
        assert!(v.size_left(0) < 4096);
        assert_eq!(v.fill_percent(0).unwrap(), 0);
    }

    #[test]
    fn max_footprint_fits_min_keys_twice() {
        for ps in [4096usize, 8192, 32768] {
            let e = max_entry_footprint(ps);
            assert!(e * (2 * MIN_KEYS + 1) <= usable_space(ps));
            assert!(e >= 255 + 6 + SLOT_SIZE + 12);
        }
    }
}
