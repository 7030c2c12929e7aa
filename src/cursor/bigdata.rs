//! cursor/bigdata — значения, не помещающиеся в leaf-ячейку.
//!
//! Big-data запись = head fragment в ячейке + прямая цепочка страниц P_BIGDATA
//! (каждая заполнена целиком, кроме последней; link -> следующая, 0 = конец).
//! Ссылка в ячейке: [full u64][tail pgno u32], где tail — первая страница цепочки.

use anyhow::Result;

use crate::consts::DB_EOF_PGNO;
use crate::error::KvError;
use crate::map::get_data_entry_size;
use crate::metrics::{record_bigdata_chain_created, record_bigdata_chain_freed};
use crate::page::common::{F_BIGDATA, PAGE_HDR_SIZE};
use crate::page::entry::{encode_bigref, encode_leaf};
use crate::page::{LeafEntry, PageMut};
use crate::txn::{PageAlloc, TxnInner};

use super::PageSource;

/// Собрать leaf-ячейку для (key, data): inline или head + цепочка продолжения.
pub(crate) fn insert_imp_head_tail(t: &mut TxnInner<'_>, key_size: usize, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let ps = t.core.page_size();
    let sz = get_data_entry_size(ps, key_size, key.len(), data.len());
    if !sz.bigdata {
        return Ok(encode_leaf(key_size, key, 0, data));
    }
    let (head, rest) = data.split_at(sz.head);
    let tail = write_chain(t, rest)?;
    let dpart = encode_bigref(data.len() as u64, tail, head);
    Ok(encode_leaf(key_size, key, F_BIGDATA, &dpart))
}

/// Записать цепочку с конца, чтобы link каждой страницы был известен сразу.
fn write_chain(t: &mut TxnInner<'_>, rest: &[u8]) -> Result<u32> {
    if rest.is_empty() {
        return Ok(DB_EOF_PGNO);
    }
    let cap = t.core.page_size() - PAGE_HDR_SIZE;
    let mut next = DB_EOF_PGNO;
    let chunks: Vec<&[u8]> = rest.chunks(cap).collect();
    for chunk in chunks.into_iter().rev() {
        let pg = t.alloc(PageAlloc::Nothing)?;
        PageMut::new(t.buf_mut(pg)?).write_bigdata(chunk, next)?;
        next = pg;
    }
    record_bigdata_chain_created();
    Ok(next)
}

/// Освободить цепочку, начиная с `tail`.
pub(crate) fn free_bigdata_pages(t: &mut TxnInner<'_>, tail: u32) -> Result<()> {
    if tail == DB_EOF_PGNO {
        return Ok(());
    }
    let mut pages = Vec::new();
    walk_chain(&*t, tail, &mut |p| {
        pages.push(p);
        Ok(())
    })?;
    for p in pages {
        t.free(p)?;
    }
    record_bigdata_chain_freed();
    Ok(())
}

/// Если запись (pgno, idx) — big-data, освободить её цепочку.
pub(crate) fn free_entry_bigdata(t: &mut TxnInner<'_>, pgno: u32, idx: usize, key_size: usize) -> Result<()> {
    let tail = {
        let page = t.page(pgno)?;
        let v = page.view();
        let e = v.leaf(idx, key_size)?;
        match e.big_ref()? {
            Some(r) => r.tail,
            None => return Ok(()),
        }
    };
    free_bigdata_pages(t, tail)
}

/// Посетить страницы цепочки (с защитой от циклов).
pub(crate) fn walk_chain(src: &dyn PageSource, first: u32, visit: &mut dyn FnMut(u32) -> Result<()>) -> Result<()> {
    let mut pg = first;
    let mut steps = 0u64;
    while pg != DB_EOF_PGNO {
        steps += 1;
        if steps > u32::MAX as u64 {
            return Err(KvError::corrupt("big-data chain loops"));
        }
        let page = src.load_page(pg)?;
        let v = page.view();
        if !v.is_bigdata() {
            return Err(KvError::corrupt(format!("page {} in big-data chain is not a big-data page", pg)));
        }
        visit(pg)?;
        pg = v.link();
    }
    Ok(())
}

/// Значение записи целиком.
pub(crate) fn read_value(src: &dyn PageSource, e: &LeafEntry<'_>) -> Result<Vec<u8>> {
    let Some(r) = e.big_ref()? else {
        return Ok(e.data.to_vec());
    };
    let full = usize::try_from(r.full).map_err(|_| KvError::corrupt("big-data length overflows usize"))?;
    if r.head.len() > full {
        return Err(KvError::corrupt("big-data head longer than the value"));
    }
    let mut out = Vec::with_capacity(full);
    out.extend_from_slice(r.head);
    let mut pg = r.tail;
    while out.len() < full {
        if pg == DB_EOF_PGNO {
            return Err(KvError::corrupt(format!(
                "big-data chain ends early: {} of {} bytes",
                out.len(),
                full
            )));
        }
        let page = src.load_page(pg)?;
        let v = page.view();
        let payload = v.bigdata_payload()?;
        if payload.is_empty() || out.len() + payload.len() > full {
            return Err(KvError::corrupt(format!("big-data page {} has a bad payload length", pg)));
        }
        out.extend_from_slice(payload);
        pg = v.link();
    }
    Ok(out)
}
