use anyhow::{Context, Result};
use std::path::PathBuf;

use QuiverLite::util::{display_text, hex_dump};
use QuiverLite::DbTable;

use super::util::open_storage;

pub fn exec(path: PathBuf, table: String, key: String, out: Option<PathBuf>) -> Result<()> {
    let stg = open_storage(&path, true)?;
    let txn = stg.begin_read()?;
    let found = match DbTable::open_existing(&txn, &table)? {
        Some(t) => t.get(&txn, key.as_bytes())?,
        None => None,
    };
    match found {
        Some(v) => {
            if let Some(out_path) = out {
                std::fs::write(&out_path, &v)
                    .with_context(|| format!("write {}", out_path.display()))?;
                println!(
                    "FOUND '{}': {} B -> wrote to {}",
                    key,
                    v.len(),
                    out_path.display()
                );
            } else {
                println!("FOUND '{}': {} B", key, v.len());
                println!("text: {}", display_text(&v));
                println!("hex:  {}", hex_dump(&v[..v.len().min(64)]));
            }
        }
        None => println!("NOT FOUND '{}' in table '{}'", key, table),
    }
    Ok(())
}
