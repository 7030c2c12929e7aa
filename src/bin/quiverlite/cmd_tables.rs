use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use QuiverLite::{DbTable, TableKind};

use super::util::open_storage;

#[derive(Serialize)]
struct TableInfo {
    name: String,
    kind: &'static str,
    key_size: usize,
    root: u32,
}

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let stg = open_storage(&path, true)?;
    let txn = stg.begin_read()?;
    let mut out = Vec::new();
    for name in txn.table_names()? {
        if let Some(t) = DbTable::open_existing(&txn, &name)? {
            let td = t.table_data(&txn)?;
            out.push(TableInfo {
                name,
                kind: match td.kind {
                    TableKind::BTree => "btree",
                    TableKind::HashTable => "hash",
                },
                key_size: td.key_size,
                root: td.root,
            });
        }
    }

    if json {
        println!("{}", serde_json::to_string(&out)?);
        return Ok(());
    }
    if out.is_empty() {
        println!("(no tables)");
    }
    for t in out {
        println!(
            "{:<24} kind={:<5} key_size={:<3} root={}",
            t.name, t.kind, t.key_size, t.root
        );
    }
    Ok(())
}
