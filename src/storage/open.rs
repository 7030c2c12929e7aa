//! storage/open — создание и открытие файла базы.
//!
//! Create: блокировка -> проверка, что по пути нет живой базы (или overwrite) ->
//! header page (slot 0) + fsync -> отображение. Free set пуст.
//! Open: блокировка (shared для read-only) -> выбор актуального слота заголовка ->
//! проверки размера файла -> отображение -> rebuild free set обходом всех таблиц.
//! Неудачный Open файл не меняет.

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::config::{LiteConfig, ViewMode};
use crate::consts::{DB_EOF_PGNO, HEADER_PAGE_SIZE};
use crate::error::KvError;
use crate::lock::{try_lock_db, LockGuard, LockMode};
use crate::meta::{read_header, validate_page_size, write_header, DbHeader};
use crate::storage::core::{HeaderState, Progress, RootState, StorageCore};
use crate::storage::free::FreePages;
use crate::storage::view::{FullMapping, MappingStrategy, ViewSet, WindowMapping};
use crate::util::round_up;

impl StorageCore {
    /// Создать новый файл базы. Живая база по пути — AlreadyExists, если не overwrite.
    pub(crate) fn create(
        path: &Path,
        cfg: &LiteConfig,
        salt: u32,
        overwrite: bool,
        progress: Option<Progress>,
    ) -> Result<Self> {
        if cfg.read_only {
            return Err(KvError::usage("cannot create a database in read-only mode"));
        }
        validate_page_size(cfg.page_size as u32)?;
        let guard = try_lock_db(path, LockMode::Exclusive)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let len = file.metadata().context("stat database file")?.len();
        if len > 0 && !overwrite && read_header(&file).is_ok() {
            return Err(anyhow::Error::new(KvError::AlreadyExists(
                path.display().to_string(),
            )));
        }

        let ps = cfg.page_size;
        let view_size = cfg.effective_view_size(ps);
        let min_len = ps.max(HEADER_PAGE_SIZE) as u64;
        let mut init_len = round_up(min_len, view_size as u64);
        if let Some(max) = cfg.max_file_size {
            let limit = max - max % ps as u64;
            if limit < min_len {
                return Err(anyhow::Error::new(KvError::Mapping(format!(
                    "{}: file size limit {} bytes is below one page",
                    path.display(),
                    max
                ))));
            }
            init_len = init_len.min(limit);
        }
        file.set_len(0)
            .and_then(|_| file.set_len(init_len))
            .with_context(|| format!("size {} to {} bytes", path.display(), init_len))?;

        let hdr = DbHeader {
            page_size: ps as u32,
            salt,
            page_count: 1,
            main_root: DB_EOF_PGNO,
            app_name: cfg.app_name.clone(),
            ..DbHeader::default()
        };
        write_header(&file, &hdr)?;
        file.sync_all().context("fsync new database")?;

        info!(
            "create {}: page_size={} salt={:#010x}",
            path.display(),
            ps,
            salt
        );
        Self::assemble(path, cfg, file, guard, hdr, false, progress)
    }

    /// Открыть существующий файл и восстановить free set.
    pub(crate) fn open(path: &Path, cfg: &LiteConfig, progress: Option<Progress>) -> Result<Self> {
        let read_only = cfg.read_only;
        let mode = if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let guard = try_lock_db(path, mode)?;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;

        let hdr = read_header(&file)?;
        let ps = hdr.page_size as u64;
        let len = file.metadata().context("stat database file")?.len();
        let need = hdr.page_count as u64 * ps;
        if len < need {
            return Err(KvError::corrupt(format!(
                "file is {} bytes, header needs {} pages of {}",
                len, hdr.page_count, ps
            )));
        }
        if hdr.main_root != DB_EOF_PGNO && hdr.main_root >= hdr.page_count {
            return Err(KvError::corrupt(format!(
                "catalog root {} beyond page count {}",
                hdr.main_root, hdr.page_count
            )));
        }
        if len % ps != 0 {
            warn!(
                "open {}: file length {} is not a multiple of page size {}",
                path.display(),
                len,
                ps
            );
        }

        let core = Self::assemble(path, cfg, file, guard, hdr, read_only, progress)?;
        let t0 = Instant::now();
        let free = core.rebuild_free_set()?;
        info!(
            "open {}: txid={} pages={} free={} mode={:?} ({} ms)",
            path.display(),
            core.header()?.last_txid,
            core.header()?.page_count,
            free,
            core.view_mode()?,
            t0.elapsed().as_millis()
        );
        Ok(core)
    }

    fn assemble(
        path: &Path,
        cfg: &LiteConfig,
        file: File,
        guard: LockGuard,
        hdr: DbHeader,
        read_only: bool,
        progress: Option<Progress>,
    ) -> Result<Self> {
        let ps = hdr.page_size as usize;
        let view_size = cfg.effective_view_size(ps);
        let file_increment = cfg.effective_file_increment(view_size);
        let file_len = file.metadata().context("stat database file")?.len();
        let writable = !read_only && !cfg.protect_pages;

        let strategy: Box<dyn MappingStrategy> = match cfg.view_mode.resolve() {
            ViewMode::Full => Box::new(FullMapping::new(&file, file_len, writable)?),
            _ => Box::new(WindowMapping::new(view_size, cfg.max_views, file_len, writable)),
        };
        let views = ViewSet::new(strategy, cfg.page_cache_pages, ps);

        Ok(Self {
            cfg: cfg.clone(),
            path: path.to_path_buf(),
            file,
            page_size: ps,
            view_size,
            file_increment,
            read_only,
            progress,
            mtx_write: Mutex::new(()),
            ckpt: Mutex::new(()),
            free: Mutex::new(FreePages::new(hdr.page_count, std::iter::empty(), hdr.last_txid)),
            root: Mutex::new(RootState {
                main_root: hdr.main_root,
                last_txid: hdr.last_txid,
            }),
            sh: RwLock::new(file_len),
            views: Mutex::new(views),
            header: Mutex::new(HeaderState {
                hdr,
                last_checkpoint: Instant::now(),
            }),
            active_txns: AtomicUsize::new(0),
            _lock: guard,
        })
    }
}
