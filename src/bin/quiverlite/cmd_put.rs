use anyhow::{anyhow, Result};
use std::path::PathBuf;

use QuiverLite::{DbTable, TableKind};

use super::cli::TableArg;
use super::util::{decode_value_arg, open_storage, read_all};

pub fn exec(
    path: PathBuf,
    table: TableArg,
    key: String,
    value: Option<String>,
    value_file: Option<PathBuf>,
) -> Result<()> {
    let val_bytes = match (value, value_file) {
        (_, Some(p)) => read_all(&p)?,
        (Some(s), None) => decode_value_arg(&s)?,
        (None, None) => return Err(anyhow!("either --value or --value-file must be provided")),
    };
    let kind = if table.hash {
        TableKind::HashTable
    } else {
        TableKind::BTree
    };

    let mut stg = open_storage(&path, false)?;
    {
        let txn = stg.begin_write()?;
        let t = match DbTable::open_existing(&txn, &table.name)? {
            Some(t) => t,
            None => DbTable::open(&txn, &table.name, kind, table.key_size)?,
        };
        t.put(&txn, key.as_bytes(), &val_bytes)?;
        txn.commit()?;
    }
    stg.close()?;
    println!(
        "OK put: table='{}' key='{}' ({} B), value={} B",
        table.name,
        key,
        key.len(),
        val_bytes.len()
    );
    Ok(())
}
