//! storage/vacuum — компактная перезапись файла базы.
//!
//! Все таблицы копируются в соседний файл `<db>-vacuum` (страницы выдаются
//! подряд, free set пуст), затем старый файл закрывается и заменяется новым.
//! Salt, user_version и app_name переносятся. До замены исходный файл не
//! меняется: ошибка копирования оставляет базу как была.
//! Требует &mut KvStorage: открытых транзакций нет.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cursor::Cursor;
use crate::error::KvError;
use crate::lock::lock_file_path;
use crate::map::{DbTable, TableKind};
use crate::storage::core::{lock, Progress, ProgressTicker, StorageCore};
use crate::storage::KvStorage;
use crate::txn::Transaction;

/// Отчёт vacuum.
#[derive(Debug, Clone, Serialize)]
pub struct VacuumSummary {
    pub tables: usize,
    pub records: u64,
    pub pages_before: u32,
    pub pages_after: u32,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub millis: u128,
}

fn vacuum_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push("-vacuum");
    PathBuf::from(s)
}

fn remove_scratch(tmp: &Path) {
    let _ = std::fs::remove_file(tmp);
    let _ = std::fs::remove_file(lock_file_path(tmp));
}

impl KvStorage {
    /// Переписать файл компактно. Прогресс тикает на каждой скопированной записи.
    pub fn vacuum(&mut self) -> Result<VacuumSummary> {
        let t0 = Instant::now();
        let core = self.core()?;
        if core.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        let path = self.path_buf()?;
        let tmp = vacuum_path(&path);
        remove_scratch(&tmp);

        let hdr = core.header()?;
        let pages_before = lock(&core.free, "free pages")?.page_count();
        let bytes_before = core.file_len()?;

        let mut cfg = self.config().clone();
        cfg.page_size = core.page_size;
        cfg.durability = false;
        cfg.async_close = false;
        cfg.app_name = hdr.app_name.clone();

        let copied = StorageCore::create(&tmp, &cfg, hdr.salt, true, None).and_then(|dst| {
            let counts = copy_tables(core, &dst, self.progress())?;
            dst.update_header(|h| h.user_version = hdr.user_version)?;
            Box::new(dst).shutdown()?;
            Ok(counts)
        });
        let (tables, records) = match copied {
            Ok(c) => c,
            Err(e) => {
                remove_scratch(&tmp);
                return Err(e.context(format!("vacuum {}", path.display())));
            }
        };

        if let Some(old) = self.take_core() {
            old.shutdown()?;
        }
        let replaced = std::fs::rename(&tmp, &path)
            .with_context(|| format!("replace {} with {}", path.display(), tmp.display()));
        let _ = std::fs::remove_file(lock_file_path(&tmp));
        if let Err(e) = replaced {
            warn!("vacuum: {:#}; reopening the original file", e);
            let core = StorageCore::open(&path, self.config(), self.progress().cloned())?;
            self.set_core(core);
            return Err(e);
        }

        let core = StorageCore::open(&path, self.config(), self.progress().cloned())?;
        let pages_after = lock(&core.free, "free pages")?.page_count();
        let bytes_after = core.file_len()?;
        self.set_core(core);

        let sum = VacuumSummary {
            tables,
            records,
            pages_before,
            pages_after,
            bytes_before,
            bytes_after,
            millis: t0.elapsed().as_millis(),
        };
        info!(
            "vacuum {}: {} tables, {} records, pages {} -> {}",
            path.display(),
            tables,
            records,
            pages_before,
            pages_after
        );
        Ok(sum)
    }
}

/// Скопировать все таблицы `src` в пустую базу `dst` одной bulk-транзакцией.
fn copy_tables(src: &StorageCore, dst: &StorageCore, progress: Option<&Progress>) -> Result<(usize, u64)> {
    let rt = Transaction::begin(src, true, false)?;
    let wt = Transaction::begin(dst, false, true)?;
    let mut ticker = ProgressTicker::new(progress);
    let names = rt.table_names()?;
    let mut records = 0u64;
    for name in &names {
        let from = DbTable::open_existing(&rt, name)?
            .ok_or_else(|| KvError::corrupt(format!("table '{}' vanished during vacuum", name)))?;
        let to = DbTable::open(&wt, name, from.kind(), from.key_size())?;
        let c = from.cursor(&rt)?;
        records += match from.kind() {
            TableKind::BTree => copy_forward(&c, &wt, &to, &mut ticker)?,
            // push_front в обратном порядке сохраняет порядок дубликатов в бакете
            TableKind::HashTable => copy_backward(&c, &wt, &to, &mut ticker)?,
        };
    }
    wt.commit()?;
    Ok((names.len(), records))
}

fn copy_forward(c: &Cursor<'_, '_>, wt: &Transaction<'_>, to: &DbTable, ticker: &mut ProgressTicker<'_>) -> Result<u64> {
    let mut n = 0u64;
    let mut more = c.seek_first()?;
    while more {
        if let (Some(k), Some(v)) = (c.key()?, c.data()?) {
            to.put(wt, &k, &v)?;
            n += 1;
            ticker.tick()?;
        }
        more = c.seek_next()?;
    }
    Ok(n)
}

fn copy_backward(c: &Cursor<'_, '_>, wt: &Transaction<'_>, to: &DbTable, ticker: &mut ProgressTicker<'_>) -> Result<u64> {
    let mut n = 0u64;
    let mut more = c.seek_last()?;
    while more {
        if let (Some(k), Some(v)) = (c.key()?, c.data()?) {
            to.push_front(wt, &k, &v)?;
            n += 1;
            ticker.tick()?;
        }
        more = c.seek_prev()?;
    }
    Ok(n)
}
