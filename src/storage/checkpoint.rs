//! storage/checkpoint — durable фиксация закоммиченного состояния.
//!
//! Порядок:
//! 1) снимок (main_root, last_txid, page_count) одним захватом MtxFreePages (+ MtxRoot
//!    внутри), там же сброс allocated_since_ckpt: писатель, освободивший страницу
//!    снимка до записи заголовка, не сможет отдать её под переиспользование;
//! 2) msync отображений + fsync файла (страницы данных на диске раньше заголовка);
//! 3) заголовок в слот seq % 2 + fsync;
//! 4) free-менеджер: страницы, ждавшие checkpoint, становятся свободными.
//!
//! Пока заголовок не записан, durable остаётся предыдущий checkpoint, а его
//! страницы не переиспользуются (pending_checkpoint).

use anyhow::{Context, Result};
use log::debug;
use std::time::Instant;

use crate::meta::write_header;
use crate::metrics::record_checkpoint;
use crate::storage::core::{lock, StorageCore};

impl StorageCore {
    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let _ck = lock(&self.ckpt, "checkpoint")?;

        let (main_root, txid, page_count, free_pages) = {
            let mut f = lock(&self.free, "free pages")?;
            let (root, txid) = self.snapshot_root()?;
            f.begin_checkpoint();
            (root, txid, f.page_count(), f.free_count() as u32)
        };

        self.flush()?;

        let mut hs = lock(&self.header, "header")?;
        let mut h = hs.hdr.clone();
        h.seq += 1;
        h.last_txid = txid;
        h.main_root = main_root;
        h.page_count = page_count;
        h.free_pages = free_pages;
        write_header(&self.file, &h)?;
        if self.cfg.use_flush {
            self.file.sync_data().context("fsync header")?;
        }
        hs.hdr = h;
        hs.last_checkpoint = Instant::now();
        drop(hs);

        lock(&self.free, "free pages")?.on_checkpoint(txid);
        record_checkpoint();
        debug!(
            "checkpoint {}: txid={} root={} pages={}",
            self.path.display(),
            txid,
            main_root,
            page_count
        );
        Ok(())
    }

    /// Истёк ли checkpoint_period с последнего checkpoint.
    pub(crate) fn checkpoint_due(&self) -> bool {
        match self.header.lock() {
            Ok(hs) => hs.last_checkpoint.elapsed() >= self.cfg.checkpoint_period,
            Err(_) => true,
        }
    }

    /// Записать заголовок с изменёнными полями (user_version, app_name) и сделать checkpoint.
    pub(crate) fn update_header<F: FnOnce(&mut crate::meta::DbHeader)>(&self, f: F) -> Result<()> {
        {
            let mut hs = lock(&self.header, "header")?;
            f(&mut hs.hdr);
        }
        self.checkpoint()
    }
}
