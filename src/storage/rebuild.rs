//! storage/rebuild — восстановление free set при открытии.
//!
//! Free set на диске не хранится: всё, что не достижимо из корня каталога
//! последнего checkpoint (каталог, таблицы, big-data цепочки), свободно.
//! Страница, встреченная дважды, означает повреждение.

use anyhow::Result;
use log::debug;

use crate::consts::DB_EOF_PGNO;
use crate::cursor::{bigdata, variant, PageSource};
use crate::error::KvError;
use crate::map::{TableData, TableKind};
use crate::storage::core::{lock, ProgressTicker, StorageCore};
use crate::storage::free::{FreePages, PageBitset};

impl StorageCore {
    /// Пересобрать free set; вернуть число свободных страниц.
    pub(crate) fn rebuild_free_set(&self) -> Result<usize> {
        let (main_root, txid) = self.snapshot_root()?;
        let page_count = lock(&self.free, "free pages")?.page_count();

        let mut used = PageBitset::with_capacity(page_count);
        used.set(DB_EOF_PGNO);
        let mut ticker = ProgressTicker::new(self.progress.as_ref());
        let mut catalog_pages = Vec::new();

        {
            let mut mark = |p: u32| -> Result<()> {
                if p >= page_count {
                    return Err(KvError::corrupt(format!(
                        "page {} referenced beyond page count {}",
                        p, page_count
                    )));
                }
                if used.get(p) {
                    return Err(KvError::corrupt(format!("page {} is referenced twice", p)));
                }
                used.set(p);
                ticker.tick()
            };

            variant(TableKind::BTree).walk_pages(self, main_root, 0, &mut |p| {
                catalog_pages.push(p);
                mark(p)
            })?;

            for td in catalog_tables(self, &catalog_pages)? {
                variant(td.kind).walk_pages(self, td.root, td.key_size, &mut mark)?;
            }
        }

        let free: Vec<u32> = (1..page_count).filter(|&p| !used.get(p)).collect();
        let n = free.len();
        *lock(&self.free, "free pages")? = FreePages::new(page_count, free, txid);
        debug!(
            "rebuild free set: {} used, {} free of {} pages",
            used.count(),
            n,
            page_count
        );
        Ok(n)
    }
}

/// Записи каталога из уже обойдённых страниц каталога.
fn catalog_tables(src: &dyn PageSource, pages: &[u32]) -> Result<Vec<TableData>> {
    let mut out = Vec::new();
    for &pg in pages {
        let page = src.load_page(pg)?;
        let v = page.view();
        if !v.is_leaf() {
            continue;
        }
        for i in 0..v.count() {
            let e = v.leaf(i, 0)?;
            let rec = bigdata::read_value(src, &e)?;
            out.push(TableData::decode(&rec)?);
        }
    }
    Ok(out)
}
