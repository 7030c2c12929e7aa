//! storage/core — StorageCore: файл, отображения, free-менеджер, корни и блокировки.
//!
//! Блокировки (порядок захвата сверху вниз, если нужны несколько):
//! - mtx_write  (MtxWrite)     — тело транзакции записи целиком, begin..commit;
//! - ckpt                      — сериализует checkpoint’ы;
//! - free       (MtxFreePages) — free set, bitset, reader_locked, регистр читателей;
//! - root       (MtxRoot)      — корень каталога + last txid (атомарная замена при commit);
//! - sh         (ShMtx)        — длина файла: shared для доступа к страницам,
//!                               exclusive для роста файла и переотображения;
//! - views      (MtxViews)     — стратегия отображения + кэш живых Page;
//! - header                    — текущий DbHeader (salt, user_version, seq...).

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::{LiteConfig, ViewMode};
use crate::consts::DB_EOF_PGNO;
use crate::error::KvError;
use crate::lock::LockGuard;
use crate::meta::DbHeader;
use crate::metrics::record_file_extension;
use crate::page::Page;
use crate::storage::free::FreePages;
use crate::storage::view::ViewSet;
use crate::util::{round_up, write_at};

pub(crate) fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| anyhow!("{} mutex poisoned", what))
}

pub(crate) fn read<'a, T>(m: &'a RwLock<T>, what: &str) -> Result<RwLockReadGuard<'a, T>> {
    m.read().map_err(|_| anyhow!("{} lock poisoned", what))
}

pub(crate) fn write<'a, T>(m: &'a RwLock<T>, what: &str) -> Result<RwLockWriteGuard<'a, T>> {
    m.write().map_err(|_| anyhow!("{} lock poisoned", what))
}

/// Колбэк прогресса: true — прервать операцию.
pub type ProgressHandler = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Progress {
    pub(crate) handler: ProgressHandler,
    pub(crate) step: u64,
}

/// Счётчик шагов длинной операции (rebuild, vacuum).
pub(crate) struct ProgressTicker<'a> {
    progress: Option<&'a Progress>,
    n: u64,
}

impl<'a> ProgressTicker<'a> {
    pub(crate) fn new(progress: Option<&'a Progress>) -> Self {
        Self { progress, n: 0 }
    }

    pub(crate) fn tick(&mut self) -> Result<()> {
        self.n += 1;
        if let Some(p) = self.progress {
            if p.step > 0 && self.n % p.step == 0 && (p.handler)() {
                return Err(anyhow::Error::new(KvError::Interrupted));
            }
        }
        Ok(())
    }
}

pub(crate) struct RootState {
    pub(crate) main_root: u32,
    pub(crate) last_txid: u64,
}

pub(crate) struct HeaderState {
    pub(crate) hdr: DbHeader,
    pub(crate) last_checkpoint: Instant,
}

pub struct StorageCore {
    pub(crate) cfg: LiteConfig,
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) page_size: usize,
    pub(crate) view_size: usize,
    pub(crate) file_increment: u64,
    pub(crate) read_only: bool,
    pub(crate) progress: Option<Progress>,

    pub(crate) mtx_write: Mutex<()>,
    pub(crate) ckpt: Mutex<()>,
    pub(crate) free: Mutex<FreePages>,
    pub(crate) root: Mutex<RootState>,
    pub(crate) sh: RwLock<u64>,
    pub(crate) views: Mutex<ViewSet>,
    pub(crate) header: Mutex<HeaderState>,

    /// Открытые транзакции (read + write).
    pub(crate) active_txns: AtomicUsize,
    pub(crate) _lock: LockGuard,
}

impl StorageCore {
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn view_mode(&self) -> Result<ViewMode> {
        Ok(lock(&self.views, "views")?.mode())
    }

    /// Живая Page для закоммиченной страницы (отображает view по требованию).
    pub(crate) fn open_page(&self, pgno: u32) -> Result<Page> {
        if pgno == DB_EOF_PGNO {
            return Err(KvError::corrupt("attempt to open the EOF page"));
        }
        let len = read(&self.sh, "ShMtx")?;
        let end = (pgno as u64 + 1) * self.page_size as u64;
        if end > *len {
            return Err(KvError::corrupt(format!(
                "page {} beyond file end ({} bytes)",
                pgno, *len
            )));
        }
        let page = lock(&self.views, "views")?.open_page(&self.file, pgno)?;
        drop(len);
        Ok(page)
    }

    /// Выделить pgno: сначала free_now (наименьший), иначе расширить файл.
    /// page_count растёт только после того, как файл уже вырос: неудачный рост
    /// не оставляет в free-менеджере (и в следующем заголовке) страниц за концом файла.
    pub(crate) fn alloc_pgno(&self) -> Result<u32> {
        if self.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        let mut f = lock(&self.free, "free pages")?;
        if let Some(p) = f.pop_free() {
            return Ok(p);
        }
        let next = f.next_extend_pgno();
        self.ensure_len((next as u64 + 1) * self.page_size as u64)?;
        f.extend()
    }

    /// Страница не была видна никому, кроме текущего писателя.
    pub(crate) fn free_unpublished(&self, pgno: u32) -> Result<()> {
        lock(&self.free, "free pages")?.add_free(pgno)
    }

    /// Рост файла шагом max(file_increment, len/4), кратно view_size,
    /// но не дальше max_file_size.
    fn ensure_len(&self, need: u64) -> Result<()> {
        if *read(&self.sh, "ShMtx")? >= need {
            return Ok(());
        }
        let mut len = write(&self.sh, "ShMtx")?;
        if *len >= need {
            return Ok(());
        }
        let step = self.file_increment.max(*len / 4);
        let mut new_len = round_up(need.max(*len + step), self.view_size as u64);
        if let Some(max) = self.cfg.max_file_size {
            let limit = max - max % self.page_size as u64;
            if need > limit {
                return Err(anyhow::Error::new(KvError::Mapping(format!(
                    "{}: file size limit {} bytes reached (need {})",
                    self.path.display(),
                    max,
                    need
                ))));
            }
            new_len = new_len.min(limit);
        }
        self.file
            .set_len(new_len)
            .with_context(|| format!("extend {} to {} bytes", self.path.display(), new_len))?;
        lock(&self.views, "views")?.grow(&self.file, new_len)?;
        debug!("extend {}: {} -> {} bytes", self.path.display(), *len, new_len);
        *len = new_len;
        record_file_extension();
        Ok(())
    }

    /// Записать страницу на её место в файле.
    pub(crate) fn write_page(&self, pgno: u32, data: &[u8]) -> Result<()> {
        if pgno == DB_EOF_PGNO {
            return Err(KvError::corrupt("attempt to write the EOF page"));
        }
        if self.cfg.protect_pages {
            let off = pgno as u64 * self.page_size as u64;
            write_at(&self.file, off, data).with_context(|| format!("write page {}", pgno))?;
            return Ok(());
        }
        let _len = read(&self.sh, "ShMtx")?;
        lock(&self.views, "views")?.write_page(&self.file, pgno, data)
    }

    /// msync + fsync (если use_flush).
    pub(crate) fn flush(&self) -> Result<()> {
        if !self.cfg.use_flush {
            return Ok(());
        }
        lock(&self.views, "views")?.flush()?;
        self.file.sync_data().context("fsync database file")?;
        Ok(())
    }

    pub(crate) fn file_len(&self) -> Result<u64> {
        Ok(*read(&self.sh, "ShMtx")?)
    }

    // ---------- roots / readers ----------

    pub(crate) fn snapshot_root(&self) -> Result<(u32, u64)> {
        let r = lock(&self.root, "root")?;
        Ok((r.main_root, r.last_txid))
    }

    /// Допуск читателя: снимок и регистрация под MtxFreePages, чтобы промоушен
    /// не проскочил между чтением снимка и регистрацией.
    pub(crate) fn begin_reader(&self) -> Result<(u32, u64)> {
        let mut f = lock(&self.free, "free pages")?;
        let (root, txid) = self.snapshot_root()?;
        f.register_reader(txid);
        Ok((root, txid))
    }

    pub(crate) fn end_reader(&self, snapshot: u64) {
        if let Ok(mut f) = self.free.lock() {
            f.unregister_reader(snapshot);
        }
    }

    /// Опубликовать новый корень каталога; вернуть txid коммита.
    pub(crate) fn publish(&self, main_root: u32, released: Vec<u32>) -> Result<u64> {
        let txid = {
            let mut r = lock(&self.root, "root")?;
            r.main_root = main_root;
            r.last_txid += 1;
            r.last_txid
        };
        lock(&self.free, "free pages")?.release(txid, released);
        Ok(txid)
    }

    pub(crate) fn header(&self) -> Result<DbHeader> {
        Ok(lock(&self.header, "header")?.hdr.clone())
    }

    pub(crate) fn txn_started(&self) {
        self.active_txns.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn txn_finished(&self) {
        self.active_txns.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn active_txns(&self) -> usize {
        self.active_txns.load(Ordering::SeqCst)
    }
}
