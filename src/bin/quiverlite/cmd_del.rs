use anyhow::Result;
use std::path::PathBuf;

use QuiverLite::DbTable;

use super::util::open_storage;

pub fn exec(path: PathBuf, table: String, key: String) -> Result<()> {
    let mut stg = open_storage(&path, false)?;
    let existed = {
        let txn = stg.begin_write()?;
        let existed = match DbTable::open_existing(&txn, &table)? {
            Some(t) => t.delete(&txn, key.as_bytes())?,
            None => false,
        };
        txn.commit()?;
        existed
    };
    stg.close()?;
    if existed {
        println!("OK del: table='{}' key='{}'", table, key);
    } else {
        println!("NOT FOUND '{}' in table '{}'", key, table);
    }
    Ok(())
}
