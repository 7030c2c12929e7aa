use anyhow::Result;
use std::path::PathBuf;

use QuiverLite::DbTable;

use super::util::open_storage;

pub fn exec(path: PathBuf, table: String) -> Result<()> {
    let mut stg = open_storage(&path, false)?;
    let dropped = {
        let txn = stg.begin_write()?;
        let dropped = DbTable::drop(&txn, &table)?;
        txn.commit()?;
        dropped
    };
    stg.close()?;
    if dropped {
        println!("OK drop-table '{}'", table);
    } else {
        println!("NOT FOUND table '{}'", table);
    }
    Ok(())
}
