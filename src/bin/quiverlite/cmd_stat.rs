use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use QuiverLite::metrics::{self, MetricsSnapshot};
use QuiverLite::{unpack_version, StorageStats};

use super::util::open_storage;

#[derive(Serialize)]
struct StatJson {
    storage: StorageStats,
    tables: usize,
    metrics: MetricsSnapshot,
}

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let stg = open_storage(&path, true)?;
    let tables = {
        let txn = stg.begin_read()?;
        txn.table_names()?.len()
    };
    let s = stg.stats()?;

    if json {
        let out = StatJson {
            storage: s,
            tables,
            metrics: metrics::snapshot(),
        };
        println!("{}", serde_json::to_string(&out)?);
        return Ok(());
    }

    let (major, minor) = unpack_version(s.user_version);
    println!("DB at {}", s.path);
    println!("  page_size        = {} bytes", s.page_size);
    println!("  page_count       = {}", s.page_count);
    println!("  file_len         = {} bytes", s.file_len);
    println!("  free_pages       = {}", s.free_pages);
    println!("  last_txid        = {}", s.last_txid);
    println!("  durable_txid     = {}", s.durable_txid);
    println!("  tables           = {}", tables);
    println!("  salt             = {:#010x}", s.salt);
    println!("  user_version     = {}.{}", major, minor);
    if !s.app_name.is_empty() {
        println!("  app_name         = {}", s.app_name);
    }
    println!("  view_mode        = {:?}", s.view_mode);
    println!("  views            = {}", s.views);
    println!(
        "  page_cache       = {}/{}",
        s.cached_pages, s.page_cache_capacity
    );
    Ok(())
}
