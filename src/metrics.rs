//! Lightweight global metrics for QuiverLite.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Page allocation / free manager
//! - Transactions / checkpoints
//! - Page cache / views
//! - Big-data chains

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Pages -----
static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PAGES_REUSED: AtomicU64 = AtomicU64::new(0);
static PAGES_RELEASED: AtomicU64 = AtomicU64::new(0);
static PAGES_PROMOTED: AtomicU64 = AtomicU64::new(0);
static FILE_EXTENSIONS: AtomicU64 = AtomicU64::new(0);

// ----- Transactions -----
static TXN_COMMITS: AtomicU64 = AtomicU64::new(0);
static TXN_ROLLBACKS: AtomicU64 = AtomicU64::new(0);
static CHECKPOINTS: AtomicU64 = AtomicU64::new(0);

// ----- Page cache / views -----
static PAGE_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static PAGE_CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static VIEWS_MAPPED: AtomicU64 = AtomicU64::new(0);
static VIEWS_EVICTED: AtomicU64 = AtomicU64::new(0);

// ----- Big-data -----
static BIGDATA_CHAINS_CREATED: AtomicU64 = AtomicU64::new(0);
static BIGDATA_CHAINS_FREED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Pages
    pub pages_allocated: u64,
    pub pages_reused: u64,
    pub pages_released: u64,
    pub pages_promoted: u64,
    pub file_extensions: u64,

    // Transactions
    pub txn_commits: u64,
    pub txn_rollbacks: u64,
    pub checkpoints: u64,

    // Page cache / views
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,
    pub views_mapped: u64,
    pub views_evicted: u64,

    // Big-data
    pub bigdata_chains_created: u64,
    pub bigdata_chains_freed: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.page_cache_hits + self.page_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.page_cache_hits as f64 / total as f64
        }
    }

    /// Доля аллокаций, обслуженных из free set (без роста файла).
    pub fn reuse_ratio(&self) -> f64 {
        if self.pages_allocated == 0 {
            0.0
        } else {
            self.pages_reused as f64 / self.pages_allocated as f64
        }
    }
}

// ----- Recorders (Pages) -----
pub fn record_page_alloc(reused: bool) {
    PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    if reused {
        PAGES_REUSED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_pages_released(n: usize) {
    PAGES_RELEASED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_pages_promoted(n: usize) {
    PAGES_PROMOTED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_file_extension() {
    FILE_EXTENSIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Transactions) -----
pub fn record_commit() {
    TXN_COMMITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_rollback() {
    TXN_ROLLBACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_checkpoint() {
    CHECKPOINTS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Page cache / views) -----
pub fn record_cache_hit() {
    PAGE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_cache_miss() {
    PAGE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_view_mapped() {
    VIEWS_MAPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_views_evicted(n: usize) {
    VIEWS_EVICTED.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Recorders (Big-data) -----
pub fn record_bigdata_chain_created() {
    BIGDATA_CHAINS_CREATED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_bigdata_chain_freed() {
    BIGDATA_CHAINS_FREED.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        pages_allocated: PAGES_ALLOCATED.load(Ordering::Relaxed),
        pages_reused: PAGES_REUSED.load(Ordering::Relaxed),
        pages_released: PAGES_RELEASED.load(Ordering::Relaxed),
        pages_promoted: PAGES_PROMOTED.load(Ordering::Relaxed),
        file_extensions: FILE_EXTENSIONS.load(Ordering::Relaxed),

        txn_commits: TXN_COMMITS.load(Ordering::Relaxed),
        txn_rollbacks: TXN_ROLLBACKS.load(Ordering::Relaxed),
        checkpoints: CHECKPOINTS.load(Ordering::Relaxed),

        page_cache_hits: PAGE_CACHE_HITS.load(Ordering::Relaxed),
        page_cache_misses: PAGE_CACHE_MISSES.load(Ordering::Relaxed),
        views_mapped: VIEWS_MAPPED.load(Ordering::Relaxed),
        views_evicted: VIEWS_EVICTED.load(Ordering::Relaxed),

        bigdata_chains_created: BIGDATA_CHAINS_CREATED.load(Ordering::Relaxed),
        bigdata_chains_freed: BIGDATA_CHAINS_FREED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    for c in [
        &PAGES_ALLOCATED,
        &PAGES_REUSED,
        &PAGES_RELEASED,
        &PAGES_PROMOTED,
        &FILE_EXTENSIONS,
        &TXN_COMMITS,
        &TXN_ROLLBACKS,
        &CHECKPOINTS,
        &PAGE_CACHE_HITS,
        &PAGE_CACHE_MISSES,
        &VIEWS_MAPPED,
        &VIEWS_EVICTED,
        &BIGDATA_CHAINS_CREATED,
        &BIGDATA_CHAINS_FREED,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
