use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use QuiverLite::util::display_text;
use QuiverLite::{CursorPos, DbTable};

use super::util::{open_storage, to_hex};

#[derive(Serialize)]
struct Item {
    key_hex: String,
    value_hex: String,
    key_len: usize,
    value_len: usize,
}

pub fn exec(
    path: PathBuf,
    table: String,
    prefix: Option<String>,
    reverse: bool,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let stg = open_storage(&path, true)?;
    let txn = stg.begin_read()?;
    let Some(t) = DbTable::open_existing(&txn, &table)? else {
        println!("(no table '{}')", table);
        return Ok(());
    };
    let pref = prefix.as_deref().map(str::as_bytes).unwrap_or_default();
    let limit = limit.unwrap_or(usize::MAX);

    let c = t.cursor(&txn)?;
    let (start, step) = if reverse {
        (CursorPos::Last, CursorPos::Prev)
    } else {
        (CursorPos::First, CursorPos::Next)
    };
    let mut acc: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut more = c.seek(start)?;
    while more && acc.len() < limit {
        if let (Some(k), Some(v)) = (c.key()?, c.data()?) {
            if k.starts_with(pref) {
                acc.push((k, v));
            }
        }
        more = c.seek(step)?;
    }

    if json {
        let items: Vec<Item> = acc
            .iter()
            .map(|(k, v)| Item {
                key_hex: to_hex(k),
                value_hex: to_hex(v),
                key_len: k.len(),
                value_len: v.len(),
            })
            .collect();
        println!("{}", serde_json::to_string(&items)?);
    } else if acc.is_empty() {
        println!("(no items)");
    } else {
        for (k, v) in acc {
            println!(
                "key='{}' ({} B) -> value '{}' ({} B)",
                display_text(&k),
                k.len(),
                display_text(&v),
                v.len()
            );
        }
    }
    Ok(())
}
