//! storage — KvStorage: жизненный цикл файла базы и вход в транзакции.
//!
//! KvStorage живёт в двух состояниях: Closed (только конфиг, salt, progress
//! handler) и Open (StorageCore). Транзакции заимствуют хранилище, поэтому
//! close/vacuum (требуют &mut self) невозможны при живых транзакциях.
//!
//! Async close: финальный checkpoint и снятие отображений выполняются в
//! фоновом потоке; wait_closed() дожидается результата. Следующий create/open
//! сначала дожидается предыдущего закрытия.

pub(crate) mod cache;
pub mod checkpoint;
pub mod core;
pub(crate) mod free;
pub mod open;
pub mod rebuild;
pub mod vacuum;
pub mod view;

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crate::config::{LiteConfig, ViewMode};
use crate::error::KvError;
use crate::meta::DbHeader;
use crate::txn::Transaction;

use self::core::{lock, Progress, ProgressHandler, StorageCore};

pub use self::vacuum::VacuumSummary;

/// Снимок состояния открытого хранилища (CLI `stat`, `--json`).
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub path: String,
    pub page_size: usize,
    pub page_count: u32,
    pub file_len: u64,
    pub free_pages: usize,
    pub reader_locked_pages: usize,
    pub pending_checkpoint_pages: usize,
    pub readers: usize,
    pub active_txns: usize,
    pub view_mode: ViewMode,
    pub views: usize,
    pub cached_pages: usize,
    pub page_cache_capacity: usize,
    pub last_txid: u64,
    pub durable_txid: u64,
    pub salt: u32,
    pub user_version: u32,
    pub app_name: String,
    pub read_only: bool,
}

pub struct KvStorage {
    cfg: LiteConfig,
    salt: Option<u32>,
    progress: Option<Progress>,
    core: Option<Box<StorageCore>>,
    closing: Option<JoinHandle<Result<()>>>,
}

impl Default for KvStorage {
    fn default() -> Self {
        Self::with_config(LiteConfig::from_env())
    }
}

impl KvStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(cfg: LiteConfig) -> Self {
        Self {
            cfg,
            salt: None,
            progress: None,
            core: None,
            closing: None,
        }
    }

    pub fn config(&self) -> &LiteConfig {
        &self.cfg
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.core.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.core.as_deref().map(|c| c.path.as_path())
    }

    pub(crate) fn core(&self) -> Result<&StorageCore> {
        self.core
            .as_deref()
            .ok_or_else(|| KvError::usage("storage is not open"))
    }

    // ---------- settings of a closed storage ----------

    /// Salt для следующего create. На открытом хранилище — ошибка Usage.
    pub fn set_salt(&mut self, salt: u32) -> Result<()> {
        if self.is_open() {
            return Err(KvError::usage("salt cannot be changed on an open storage"));
        }
        self.salt = Some(salt);
        Ok(())
    }

    /// Salt открытой базы (из заголовка) или заданный для create.
    pub fn salt(&self) -> Result<Option<u32>> {
        match self.core.as_deref() {
            Some(c) => Ok(Some(c.header()?.salt)),
            None => Ok(self.salt),
        }
    }

    /// Колбэк прогресса для rebuild/vacuum: вызывается каждые `step` страниц,
    /// true — прервать операцию. None снимает обработчик.
    pub fn set_progress_handler(&mut self, handler: Option<ProgressHandler>, step: u64) {
        self.progress = handler.map(|handler| Progress {
            handler,
            step: step.max(1),
        });
        if let Some(core) = self.core.as_deref_mut() {
            core.progress = self.progress.clone();
        }
    }

    // ---------- lifecycle ----------

    /// Создать новую базу. Существующая валидная база — AlreadyExists, если не `overwrite`.
    pub fn create<P: AsRef<Path>>(&mut self, path: P, overwrite: bool) -> Result<()> {
        self.ensure_closed()?;
        let salt = self.salt.unwrap_or_else(rand::random::<u32>);
        let core = StorageCore::create(path.as_ref(), &self.cfg, salt, overwrite, self.progress.clone())?;
        self.core = Some(Box::new(core));
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_closed()?;
        let core = StorageCore::open(path.as_ref(), &self.cfg, self.progress.clone())?;
        self.core = Some(Box::new(core));
        Ok(())
    }

    /// Закрыть: финальный checkpoint, снятие всех отображений, снятие блокировки.
    /// С async_close работа уходит в фоновый поток (см. wait_closed).
    pub fn close(&mut self) -> Result<()> {
        let Some(core) = self.core.take() else {
            return Ok(());
        };
        if core.active_txns() != 0 {
            warn!("close with {} active transactions", core.active_txns());
        }
        if self.cfg.async_close {
            let h = std::thread::Builder::new()
                .name("quiverlite-close".into())
                .spawn(move || core.shutdown())
                .map_err(|e| anyhow!("spawn close thread: {}", e))?;
            self.closing = Some(h);
            return Ok(());
        }
        core.shutdown()
    }

    /// Дождаться асинхронного закрытия (no-op, если его не было).
    pub fn wait_closed(&mut self) -> Result<()> {
        match self.closing.take() {
            Some(h) => h
                .join()
                .map_err(|_| anyhow!("close thread panicked"))?,
            None => Ok(()),
        }
    }

    fn ensure_closed(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(KvError::usage("storage is already open"));
        }
        self.wait_closed()
    }

    // ---------- transactions ----------

    pub fn begin(&self, read_only: bool) -> Result<Transaction<'_>> {
        Transaction::begin(self.core()?, read_only, false)
    }

    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        self.begin(true)
    }

    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        self.begin(false)
    }

    /// Транзакция записи без периодического checkpoint на commit.
    pub fn begin_bulk(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self.core()?, false, true)
    }

    // ---------- maintenance ----------

    /// Durable-фиксация текущего закоммиченного состояния.
    pub fn checkpoint(&self) -> Result<()> {
        let core = self.core()?;
        if core.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        core.checkpoint()
    }

    pub fn set_user_version(&self, v: u32) -> Result<()> {
        let core = self.core()?;
        if core.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        core.update_header(|h| h.user_version = v)
    }

    pub fn user_version(&self) -> Result<u32> {
        Ok(self.core()?.header()?.user_version)
    }

    pub fn set_app_name(&self, name: &str) -> Result<()> {
        let core = self.core()?;
        if core.read_only {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        if name.len() > crate::consts::MAX_APP_NAME {
            return Err(KvError::usage(format!(
                "app name too long: {} > {}",
                name.len(),
                crate::consts::MAX_APP_NAME
            )));
        }
        core.update_header(|h| h.app_name = name.to_string())
    }

    /// Заголовок последнего checkpoint.
    pub fn header(&self) -> Result<DbHeader> {
        self.core()?.header()
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let core = self.core()?;
        let hdr = core.header()?;
        let (_, last_txid) = core.snapshot_root()?;
        let (page_count, free_pages, reader_locked_pages, pending, readers) = {
            let f = lock(&core.free, "free pages")?;
            (
                f.page_count(),
                f.free_count(),
                f.reader_locked_count(),
                f.pending_checkpoint_count(),
                f.reader_count(),
            )
        };
        let (view_mode, views, cached_pages, page_cache_capacity) = {
            let v = lock(&core.views, "views")?;
            (v.mode(), v.view_count(), v.cached_pages(), v.page_cache_capacity())
        };
        Ok(StorageStats {
            path: core.path.display().to_string(),
            page_size: core.page_size,
            page_count,
            file_len: core.file_len()?,
            free_pages,
            reader_locked_pages,
            pending_checkpoint_pages: pending,
            readers,
            active_txns: core.active_txns(),
            view_mode,
            views,
            cached_pages,
            page_cache_capacity,
            last_txid,
            durable_txid: hdr.last_txid,
            salt: hdr.salt,
            user_version: hdr.user_version,
            app_name: hdr.app_name,
            read_only: core.read_only,
        })
    }

    /// Путь открытой базы (для vacuum/CLI).
    pub(crate) fn path_buf(&self) -> Result<PathBuf> {
        Ok(self.core()?.path.clone())
    }

    pub(crate) fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub(crate) fn set_core(&mut self, core: StorageCore) {
        self.core = Some(Box::new(core));
    }

    pub(crate) fn take_core(&mut self) -> Option<Box<StorageCore>> {
        self.core.take()
    }
}

impl Drop for KvStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("close on drop: {:#}", e);
        }
        if let Err(e) = self.wait_closed() {
            warn!("async close: {:#}", e);
        }
    }
}

impl StorageCore {
    /// Финальный checkpoint и освобождение отображений.
    pub(crate) fn shutdown(self: Box<Self>) -> Result<()> {
        let path = self.path.clone();
        if !self.read_only {
            self.checkpoint()?;
        }
        lock(&self.views, "views")?.drop_page_cache();
        drop(self);
        info!("closed {}", path.display());
        Ok(())
    }
}
