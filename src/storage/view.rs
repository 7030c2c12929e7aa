//! storage/view — отображение файла в память.
//!
//! View — одно отображение непрерывного диапазона файла `[offset, offset+len)`.
//! Стратегии (выбираются при открытии хранилища, не при компиляции):
//! - FullMapping: весь файл отображается сразу; рост файла добавляет ещё одно
//!   отображение на новый хвост, существующие не переотображаются.
//! - WindowMapping: view фиксированного размера с индексом N покрывает
//!   `[N*view_size, (N+1)*view_size)`; не более max_views в LRU, при переполнении
//!   выталкивается DB_NUM_DELETE_FROM_CACHE самых старых.
//!
//! Снятие отображения происходит при Drop последнего Arc<View>. Page держит
//! Arc<View>, поэтому view никогда не снимается под живой страницей.
//!
//! ViewSet (под MtxViews) объединяет стратегию и кэш живых Page.

use anyhow::{Context, Result};
use log::debug;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::File;
use std::sync::Arc;

use crate::config::ViewMode;
use crate::consts::DB_NUM_DELETE_FROM_CACHE;
use crate::error::KvError;
use crate::metrics::{record_cache_hit, record_cache_miss, record_view_mapped, record_views_evicted};
use crate::page::Page;
use crate::storage::cache::Lru;

pub struct View {
    offset: u64,
    len: usize,
    writable: bool,
    map: MmapRaw,
}

impl View {
    pub(crate) fn map(file: &File, offset: u64, len: usize, writable: bool) -> Result<Arc<View>> {
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(len);
        let map = if writable {
            opts.map_raw(file)
        } else {
            opts.map_raw_read_only(file)
        }
        .map_err(|e| {
            anyhow::Error::new(KvError::Mapping(format!(
                "map [{}..{}): {}",
                offset,
                offset + len as u64,
                e
            )))
        })?;
        record_view_mapped();
        Ok(Arc::new(View {
            offset,
            len,
            writable,
            map,
        }))
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    fn contains(&self, file_off: u64, len: usize) -> bool {
        file_off >= self.offset && file_off + len as u64 <= self.offset + self.len as u64
    }

    /// Срез внутри view. Границы проверены в locate(); здесь — только assert.
    pub(crate) fn slice(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.len, "view slice out of bounds");
        // SAFETY: отображение живо, пока жив self; диапазон внутри отображения.
        // Committed-страницы не перезаписываются, пока их может видеть читатель.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(off), len) }
    }

    /// Скопировать данные в отображение (только writable view).
    pub(crate) fn write(&self, off: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(anyhow::Error::new(KvError::ReadOnly));
        }
        if off + data.len() > self.len {
            return Err(KvError::corrupt(format!(
                "write [{}..{}) outside view of {} bytes",
                off,
                off + data.len(),
                self.len
            )));
        }
        // SAFETY: диапазон внутри отображения; пишутся только страницы, выделенные
        // текущей транзакцией записи, их не видит ни один читатель.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(off), data.len());
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        if self.writable {
            self.map
                .flush()
                .with_context(|| format!("msync view @{}", self.offset))?;
        }
        Ok(())
    }
}

/// Стратегия отображения файла.
pub(crate) trait MappingStrategy: Send {
    fn mode(&self) -> ViewMode;
    /// View, покрывающий `[file_off, file_off+len)`, и смещение внутри него.
    fn locate(&mut self, file: &File, file_off: u64, len: usize) -> Result<(Arc<View>, usize)>;
    /// Файл вырос до `new_len` (set_len уже выполнен).
    fn grow(&mut self, file: &File, new_len: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn view_count(&self) -> usize;
}

pub(crate) struct FullMapping {
    maps: Vec<Arc<View>>,
    mapped_len: u64,
    writable: bool,
}

impl FullMapping {
    pub(crate) fn new(file: &File, file_len: u64, writable: bool) -> Result<Self> {
        let mut m = Self {
            maps: Vec::new(),
            mapped_len: 0,
            writable,
        };
        m.grow(file, file_len)?;
        Ok(m)
    }
}

impl MappingStrategy for FullMapping {
    fn mode(&self) -> ViewMode {
        ViewMode::Full
    }

    fn locate(&mut self, _file: &File, file_off: u64, len: usize) -> Result<(Arc<View>, usize)> {
        // отображения отсортированы по offset и не пересекаются
        let i = self.maps.partition_point(|v| v.offset + v.len as u64 <= file_off);
        match self.maps.get(i) {
            Some(v) if v.contains(file_off, len) => {
                Ok((v.clone(), (file_off - v.offset) as usize))
            }
            _ => Err(anyhow::Error::new(KvError::Mapping(format!(
                "offset {} (+{}) is not mapped (mapped_len={})",
                file_off, len, self.mapped_len
            )))),
        }
    }

    fn grow(&mut self, file: &File, new_len: u64) -> Result<()> {
        if new_len <= self.mapped_len {
            return Ok(());
        }
        let len = (new_len - self.mapped_len) as usize;
        let v = View::map(file, self.mapped_len, len, self.writable)?;
        debug!(
            "full mapping: +[{}..{}) ({} maps)",
            self.mapped_len,
            new_len,
            self.maps.len() + 1
        );
        self.maps.push(v);
        self.mapped_len = new_len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for v in &self.maps {
            v.flush()?;
        }
        Ok(())
    }

    fn view_count(&self) -> usize {
        self.maps.len()
    }
}

pub(crate) struct WindowMapping {
    view_size: usize,
    max_views: usize,
    file_len: u64,
    writable: bool,
    views: Lru<u64, Arc<View>>,
}

impl WindowMapping {
    pub(crate) fn new(view_size: usize, max_views: usize, file_len: u64, writable: bool) -> Self {
        Self {
            view_size,
            max_views: max_views.max(1),
            file_len,
            writable,
            // вытеснение делаем сами пачками, поэтому ёмкость с запасом
            views: Lru::new(max_views.max(1) + DB_NUM_DELETE_FROM_CACHE),
        }
    }

    fn evict_batch(&mut self) {
        let mut n = 0;
        while n < DB_NUM_DELETE_FROM_CACHE {
            match self.views.pop_lru() {
                Some((_, v)) => {
                    // снимется при Drop последнего Arc — возможно, позже (живые Page)
                    let _ = v.flush();
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            record_views_evicted(n);
            debug!("window mapping: evicted {} views", n);
        }
    }
}

impl MappingStrategy for WindowMapping {
    fn mode(&self) -> ViewMode {
        ViewMode::Window
    }

    fn locate(&mut self, file: &File, file_off: u64, len: usize) -> Result<(Arc<View>, usize)> {
        let idx = file_off / self.view_size as u64;
        if let Some(v) = self.views.get(idx) {
            if v.contains(file_off, len) {
                return Ok((v.clone(), (file_off - v.offset) as usize));
            }
        }
        let start = idx * self.view_size as u64;
        if start >= self.file_len {
            return Err(anyhow::Error::new(KvError::Mapping(format!(
                "offset {} beyond file end {}",
                file_off, self.file_len
            ))));
        }
        let vlen = (self.file_len - start).min(self.view_size as u64) as usize;
        if self.views.len() >= self.max_views {
            self.evict_batch();
        }
        let v = View::map(file, start, vlen, self.writable)?;
        if !v.contains(file_off, len) {
            return Err(anyhow::Error::new(KvError::Mapping(format!(
                "page at {} (+{}) straddles view boundary",
                file_off, len
            ))));
        }
        self.views.put(idx, v.clone());
        Ok((v, (file_off - start) as usize))
    }

    fn grow(&mut self, _file: &File, new_len: u64) -> Result<()> {
        if new_len > self.file_len {
            // укороченный последний view надо переотобразить целиком
            let last = self.file_len / self.view_size as u64;
            if self.file_len % self.view_size as u64 != 0 {
                self.views.remove(last);
            }
            self.file_len = new_len;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for v in self.views.values() {
            v.flush()?;
        }
        Ok(())
    }

    fn view_count(&self) -> usize {
        self.views.len()
    }
}

/// Стратегия отображения + кэш живых Page (всё под MtxViews).
pub(crate) struct ViewSet {
    strategy: Box<dyn MappingStrategy>,
    pages: Lru<u32, Page>,
    page_size: usize,
}

impl ViewSet {
    pub(crate) fn new(strategy: Box<dyn MappingStrategy>, page_cache_pages: usize, page_size: usize) -> Self {
        Self {
            strategy,
            pages: Lru::new(page_cache_pages),
            page_size,
        }
    }

    pub(crate) fn mode(&self) -> ViewMode {
        self.strategy.mode()
    }

    pub(crate) fn open_page(&mut self, file: &File, pgno: u32) -> Result<Page> {
        if let Some(p) = self.pages.get(pgno) {
            record_cache_hit();
            return Ok(p.clone());
        }
        record_cache_miss();
        let off = pgno as u64 * self.page_size as u64;
        let (view, in_view) = self.strategy.locate(file, off, self.page_size)?;
        let page = Page::mapped(pgno, view, in_view, self.page_size);
        self.pages.put(pgno, page.clone());
        Ok(page)
    }

    /// Скопировать страницу в отображение.
    pub(crate) fn write_page(&mut self, file: &File, pgno: u32, data: &[u8]) -> Result<()> {
        let off = pgno as u64 * self.page_size as u64;
        let (view, in_view) = self.strategy.locate(file, off, data.len())?;
        view.write(in_view, data)
    }

    pub(crate) fn grow(&mut self, file: &File, new_len: u64) -> Result<()> {
        self.strategy.grow(file, new_len)
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.strategy.flush()
    }

    pub(crate) fn view_count(&self) -> usize {
        self.strategy.view_count()
    }

    pub(crate) fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn page_cache_capacity(&self) -> usize {
        self.pages.capacity()
    }

    /// Отпустить кэш Page (view, которые держались только им, снимутся).
    pub(crate) fn drop_page_cache(&mut self) {
        self.pages.clear();
    }
}
