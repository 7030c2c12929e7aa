//! Centralized configuration and builder for QuiverLite.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - LiteConfig::from_env() reads QL_* variables on top of the defaults.
//! - StorageBuilder returns a closed KvStorage with the config applied.
//!
//! Defaults follow the platform: on 64-bit address spaces the whole file is mapped
//! once (ViewMode::Full) and view/cache sizes are doubled; otherwise the storage
//! keeps a bounded window of views.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::consts::{
    DB_DEFAULT_PAGECACHE_SIZE, DB_MAX_VIEWS, DEFAULT_PAGE_SIZE, IS_64BIT,
};

/// Как отображать файл в память.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ViewMode {
    /// Full на 64-bit, Window иначе.
    Auto,
    /// Скользящее окно view фиксированного размера (LRU, не более max_views).
    Window,
    /// Весь файл отображается сразу; рост добавляет новые отображения.
    Full,
}

impl ViewMode {
    /// Разрешить Auto в конкретный режим для текущей платформы.
    pub fn resolve(self) -> ViewMode {
        match self {
            ViewMode::Auto => {
                if IS_64BIT {
                    ViewMode::Full
                } else {
                    ViewMode::Window
                }
            }
            other => other,
        }
    }

    fn parse(s: &str) -> Option<ViewMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ViewMode::Auto),
            "window" | "windowed" => Some(ViewMode::Window),
            "full" => Some(ViewMode::Full),
            _ => None,
        }
    }
}

/// Top-level configuration of a KvStorage.
#[derive(Clone, Debug, Serialize)]
pub struct LiteConfig {
    /// Page size for newly created files (existing files keep theirs).
    /// Env: QL_PAGE_SIZE (default 4096)
    pub page_size: usize,

    /// Env: QL_VIEW_MODE = auto|window|full (default auto)
    pub view_mode: ViewMode,

    /// View size in bytes; None means 64 pages, doubled on 64-bit.
    /// Env: QL_VIEW_SIZE
    pub view_size: Option<usize>,

    /// Env: QL_MAX_VIEWS (default 2048, doubled on 64-bit)
    pub max_views: usize,

    /// Minimal file growth step in bytes; None means one view.
    /// Env: QL_FILE_INCREMENT
    pub file_increment: Option<u64>,

    /// Upper bound of the database file in bytes; growth past it fails the
    /// allocating transaction with KvError::Mapping. None means unlimited.
    /// Env: QL_MAX_FILE_SIZE
    pub max_file_size: Option<u64>,

    /// Capacity of the live page cache (0 disables).
    /// Env: QL_PAGE_CACHE_PAGES
    pub page_cache_pages: usize,

    /// Minimal interval between periodic checkpoints.
    /// Env: QL_CHECKPOINT_PERIOD_MS (default 30000)
    #[serde(skip)]
    pub checkpoint_period: Duration,

    /// Checkpoint (flush + header + fsync) on every commit.
    /// Env: QL_DURABILITY (default true)
    pub durability: bool,

    /// Issue msync/fsync at all. Turning it off is unsafe: a crash may lose
    /// or tear any state written since the OS last flushed on its own.
    /// Env: QL_USE_FLUSH (default true)
    pub use_flush: bool,

    /// Map views read-only and write committed pages with positional writes,
    /// so a stray write through a page pointer faults instead of corrupting.
    /// Env: QL_PROTECT_PAGES (default false)
    pub protect_pages: bool,

    /// Env: QL_READ_ONLY (default false)
    pub read_only: bool,

    /// Close flushes in a background thread (see KvStorage::wait_closed).
    /// Env: QL_ASYNC_CLOSE (default false)
    pub async_close: bool,

    /// Stored in the header on create / checkpoint.
    pub app_name: String,
}

impl Default for LiteConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            view_mode: ViewMode::Auto,
            view_size: None,
            max_views: DB_MAX_VIEWS,
            file_increment: None,
            max_file_size: None,
            page_cache_pages: DB_DEFAULT_PAGECACHE_SIZE,
            checkpoint_period: Duration::from_secs(30),
            durability: true,
            use_flush: true,
            protect_pages: false,
            read_only: false,
            async_close: false,
            app_name: String::new(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl LiteConfig {
    /// Load configuration from QL_* environment variables over the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_num::<usize>("QL_PAGE_SIZE") {
            cfg.page_size = n;
        }
        if let Ok(v) = std::env::var("QL_VIEW_MODE") {
            if let Some(m) = ViewMode::parse(&v) {
                cfg.view_mode = m;
            }
        }
        if let Some(n) = env_num::<usize>("QL_VIEW_SIZE") {
            cfg.view_size = Some(n);
        }
        if let Some(n) = env_num::<usize>("QL_MAX_VIEWS") {
            cfg.max_views = n.max(1);
        }
        if let Some(n) = env_num::<u64>("QL_FILE_INCREMENT") {
            cfg.file_increment = Some(n);
        }
        if let Some(n) = env_num::<u64>("QL_MAX_FILE_SIZE") {
            cfg.max_file_size = Some(n);
        }
        if let Some(n) = env_num::<usize>("QL_PAGE_CACHE_PAGES") {
            cfg.page_cache_pages = n;
        }
        if let Some(ms) = env_num::<u64>("QL_CHECKPOINT_PERIOD_MS") {
            cfg.checkpoint_period = Duration::from_millis(ms);
        }
        if let Some(b) = env_flag("QL_DURABILITY") {
            cfg.durability = b;
        }
        if let Some(b) = env_flag("QL_USE_FLUSH") {
            cfg.use_flush = b;
        }
        if let Some(b) = env_flag("QL_PROTECT_PAGES") {
            cfg.protect_pages = b;
        }
        if let Some(b) = env_flag("QL_READ_ONLY") {
            cfg.read_only = b;
        }
        if let Some(b) = env_flag("QL_ASYNC_CLOSE") {
            cfg.async_close = b;
        }

        cfg
    }

    /// Effective view size for a given page size.
    pub fn effective_view_size(&self, page_size: usize) -> usize {
        let default = (page_size * 64) << (IS_64BIT as usize);
        let vs = self.view_size.unwrap_or(default).max(page_size);
        // view всегда кратен странице
        vs.div_ceil(page_size) * page_size
    }

    /// Effective growth step (bytes) for a given view size.
    pub fn effective_file_increment(&self, view_size: usize) -> u64 {
        self.file_increment.unwrap_or(view_size as u64).max(view_size as u64)
    }

    // ----- fluent setters -----

    pub fn with_page_size(mut self, ps: usize) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_view_mode(mut self, m: ViewMode) -> Self {
        self.view_mode = m;
        self
    }

    pub fn with_view_size(mut self, vs: Option<usize>) -> Self {
        self.view_size = vs;
        self
    }

    pub fn with_max_views(mut self, n: usize) -> Self {
        self.max_views = n.max(1);
        self
    }

    pub fn with_file_increment(mut self, inc: Option<u64>) -> Self {
        self.file_increment = inc;
        self
    }

    pub fn with_max_file_size(mut self, max: Option<u64>) -> Self {
        self.max_file_size = max;
        self
    }

    pub fn with_page_cache_pages(mut self, pages: usize) -> Self {
        self.page_cache_pages = pages;
        self
    }

    pub fn with_checkpoint_period(mut self, d: Duration) -> Self {
        self.checkpoint_period = d;
        self
    }

    pub fn with_durability(mut self, on: bool) -> Self {
        self.durability = on;
        self
    }

    pub fn with_use_flush(mut self, on: bool) -> Self {
        self.use_flush = on;
        self
    }

    pub fn with_protect_pages(mut self, on: bool) -> Self {
        self.protect_pages = on;
        self
    }

    pub fn with_read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn with_async_close(mut self, on: bool) -> Self {
        self.async_close = on;
        self
    }

    pub fn with_app_name<S: Into<String>>(mut self, name: S) -> Self {
        self.app_name = name.into();
        self
    }
}

impl fmt::Display for LiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LiteConfig {{ page_size: {}, view_mode: {:?}, view_size: {}, max_views: {}, \
             file_increment: {}, max_file_size: {}, page_cache_pages: {}, checkpoint_period_ms: {}, \
             durability: {}, use_flush: {}, protect_pages: {}, read_only: {}, async_close: {} }}",
            self.page_size,
            self.view_mode,
            self.view_size
                .map(|v| v.to_string())
                .unwrap_or_else(|| "default(64 pages)".to_string()),
            self.max_views,
            self.file_increment
                .map(|v| v.to_string())
                .unwrap_or_else(|| "default(view)".to_string()),
            self.max_file_size
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
            self.page_cache_pages,
            self.checkpoint_period.as_millis(),
            self.durability,
            self.use_flush,
            self.protect_pages,
            self.read_only,
            self.async_close,
        )
    }
}

/// Lightweight builder producing a closed KvStorage.
#[derive(Clone, Debug)]
pub struct StorageBuilder {
    cfg: LiteConfig,
    salt: Option<u32>,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: LiteConfig::from_env(),
            salt: None,
        }
    }
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: LiteConfig::default(),
            salt: None,
        }
    }

    pub fn config(mut self, cfg: LiteConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn page_size(mut self, ps: usize) -> Self {
        self.cfg.page_size = ps;
        self
    }

    pub fn view_mode(mut self, m: ViewMode) -> Self {
        self.cfg.view_mode = m;
        self
    }

    pub fn checkpoint_period(mut self, d: Duration) -> Self {
        self.cfg.checkpoint_period = d;
        self
    }

    pub fn durability(mut self, on: bool) -> Self {
        self.cfg.durability = on;
        self
    }

    pub fn protect_pages(mut self, on: bool) -> Self {
        self.cfg.protect_pages = on;
        self
    }

    pub fn max_file_size(mut self, max: u64) -> Self {
        self.cfg.max_file_size = Some(max);
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.cfg.read_only = on;
        self
    }

    pub fn async_close(mut self, on: bool) -> Self {
        self.cfg.async_close = on;
        self
    }

    /// Fixed salt for a file created by this storage (random otherwise).
    pub fn salt(mut self, salt: u32) -> Self {
        self.salt = Some(salt);
        self
    }

    pub fn build(self) -> crate::storage::KvStorage {
        let mut stg = crate::storage::KvStorage::with_config(self.cfg);
        if let Some(s) = self.salt {
            // хранилище закрыто — set_salt не может упасть
            let _ = stg.set_salt(s);
        }
        stg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_size_is_page_multiple() {
        let cfg = LiteConfig::default().with_view_size(Some(10_000));
        assert_eq!(cfg.effective_view_size(4096), 12288);
        let cfg = LiteConfig::default();
        assert_eq!(
            cfg.effective_view_size(4096),
            (4096 * 64) << (IS_64BIT as usize)
        );
    }

    #[test]
    fn auto_resolves_by_platform() {
        let m = ViewMode::Auto.resolve();
        if IS_64BIT {
            assert_eq!(m, ViewMode::Full);
        } else {
            assert_eq!(m, ViewMode::Window);
        }
        assert_eq!(ViewMode::Window.resolve(), ViewMode::Window);
    }

    #[test]
    fn increment_never_below_view() {
        let cfg = LiteConfig::default().with_file_increment(Some(1));
        assert_eq!(cfg.effective_file_increment(65536), 65536);
    }
}
