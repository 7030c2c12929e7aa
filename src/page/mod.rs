//! page — страницы файла: заголовок, ячейки, big-data и hash directory.
//!
//! Разделение по подмодулям:
//! - common.rs — offset’ы заголовка страницы, флаги типов, размеры ячеек.
//! - entry.rs  — кодек leaf/branch ячеек и ссылки на big-data.
//! - layout.rs — PageView (layout-запросы) и PageMut (примитивы изменения).
//!
//! `Page` — живой дескриптор страницы: либо окно в отображённый View
//! (committed-страница), либо heap-буфер грязной страницы транзакции записи.
//! Mapped-дескриптор держит Arc<View>, поэтому view не будет снят, пока страница жива.

pub mod common;
pub mod layout;
pub mod entry;

use std::sync::Arc;

use crate::storage::view::View;

pub use self::common::{P_BIGDATA, P_BRANCH, P_HASHDIR, P_LEAF, PAGE_HDR_SIZE};
pub use self::layout::{max_entry_footprint, usable_space, OverflowCell, PageMut, PageView};
pub use self::entry::{BigRef, LeafEntry};

#[derive(Clone)]
enum PageRepr {
    Mapped {
        view: Arc<View>,
        offset: usize,
        len: usize,
    },
    Heap(Arc<Vec<u8>>),
}

#[derive(Clone)]
pub struct Page {
    pgno: u32,
    repr: PageRepr,
}

impl Page {
    pub(crate) fn mapped(pgno: u32, view: Arc<View>, offset: usize, len: usize) -> Self {
        Self {
            pgno,
            repr: PageRepr::Mapped { view, offset, len },
        }
    }

    pub(crate) fn heap(pgno: u32, buf: Arc<Vec<u8>>) -> Self {
        Self {
            pgno,
            repr: PageRepr::Heap(buf),
        }
    }

    #[inline]
    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    pub fn data(&self) -> &[u8] {
        match &self.repr {
            PageRepr::Mapped { view, offset, len } => view.slice(*offset, *len),
            PageRepr::Heap(buf) => buf.as_slice(),
        }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(self.data())
    }

    /// Грязная страница (изменена в текущей транзакции записи, ещё не durable).
    pub fn is_dirty(&self) -> bool {
        matches!(self.repr, PageRepr::Heap(_))
    }

    /// Страница отображена с защитой от записи.
    pub fn is_read_only(&self) -> bool {
        match &self.repr {
            PageRepr::Mapped { view, .. } => !view.is_writable(),
            PageRepr::Heap(_) => false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.view().is_leaf()
    }

    pub fn is_branch(&self) -> bool {
        self.view().is_branch()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.view();
        f.debug_struct("Page")
            .field("pgno", &self.pgno)
            .field("flags", &v.flags())
            .field("num", &v.num())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
