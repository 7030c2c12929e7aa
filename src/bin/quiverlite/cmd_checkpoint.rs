use anyhow::Result;
use std::path::PathBuf;

use super::util::open_storage;

pub fn exec(path: PathBuf) -> Result<()> {
    let mut stg = open_storage(&path, false)?;
    stg.checkpoint()?;
    let h = stg.header()?;
    stg.close()?;
    println!(
        "Checkpoint OK: txid={} pages={} root={}",
        h.last_txid, h.page_count, h.main_root
    );
    Ok(())
}
