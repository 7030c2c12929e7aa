//! txn/alloc — выделение и освобождение страниц внутри транзакции записи.
//!
//! Режимы (PageAlloc):
//! - Zero / Nothing — новая страница (нули; Nothing — вызывающий перепишет целиком);
//! - Leaf / Branch  — новая страница с инициализированным заголовком;
//! - Copy(src)      — новая страница с копией src (copy-on-write);
//! - Move(src)      — Copy + освобождение src.
//!
//! Страница, выделенная в этой же транзакции, правится на месте; любая другая
//! меняется только через Copy/Move (см. touch).

use anyhow::Result;
use std::sync::Arc;

use crate::consts::DB_EOF_PGNO;
use crate::error::KvError;
use crate::page::{PageMut, P_BRANCH, P_LEAF};

use super::{DirtyPage, TxnInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAlloc {
    Zero,
    Nothing,
    Leaf,
    Branch,
    Copy(u32),
    Move(u32),
}

impl<'s> TxnInner<'s> {
    pub(crate) fn alloc(&mut self, mode: PageAlloc) -> Result<u32> {
        if self.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        let ps = self.core.page_size();
        // содержимое источника читаем до выделения pgno: ошибка не должна терять страницу
        let buf = match mode {
            PageAlloc::Zero | PageAlloc::Nothing => vec![0u8; ps],
            PageAlloc::Leaf | PageAlloc::Branch => {
                let mut b = vec![0u8; ps];
                let flags = if mode == PageAlloc::Leaf { P_LEAF } else { P_BRANCH };
                PageMut::new(&mut b).init(flags);
                b
            }
            PageAlloc::Copy(src) | PageAlloc::Move(src) => self.page(src)?.data().to_vec(),
        };
        let pgno = self.core.alloc_pgno()?;
        self.dirty.insert(
            pgno,
            DirtyPage {
                buf: Arc::new(buf),
                ovfl: Vec::new(),
            },
        );
        self.allocated.insert(pgno);
        if let PageAlloc::Move(src) = mode {
            self.free(src)?;
        }
        Ok(pgno)
    }

    /// Освободить страницу. Своя (выделенная в этой транзакции) сразу уходит
    /// в free set; чужая попадает в released и станет свободной по правилу читателей.
    pub(crate) fn free(&mut self, pgno: u32) -> Result<()> {
        if pgno == DB_EOF_PGNO {
            return Err(KvError::corrupt("attempt to free the EOF page"));
        }
        if self.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        if self.allocated.remove(&pgno) {
            self.dirty.remove(&pgno);
            self.core.free_unpublished(pgno)
        } else {
            self.released.push(pgno);
            Ok(())
        }
    }

    /// Сделать страницу изменяемой: своя возвращается как есть, иначе Move.
    pub(crate) fn touch(&mut self, pgno: u32) -> Result<u32> {
        if self.allocated.contains(&pgno) {
            return Ok(pgno);
        }
        self.alloc(PageAlloc::Move(pgno))
    }
}
