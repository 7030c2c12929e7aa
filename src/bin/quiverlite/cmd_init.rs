use anyhow::Result;
use std::path::PathBuf;

use QuiverLite::{KvStorage, LiteConfig};

pub fn exec(path: PathBuf, page_size: usize, salt: Option<u32>, overwrite: bool) -> Result<()> {
    let cfg = LiteConfig::from_env().with_page_size(page_size);
    let mut stg = KvStorage::with_config(cfg);
    if let Some(s) = salt {
        stg.set_salt(s)?;
    }
    stg.create(&path, overwrite)?;
    let h = stg.header()?;
    stg.close()?;
    println!(
        "Initialized DB at {} (page_size={}, salt={:#010x})",
        path.display(),
        h.page_size,
        h.salt
    );
    Ok(())
}
