// tests/bigdata.rs
//
// Значения, не помещающиеся в страницу (head-фрагмент в записи + цепочка
// big-data страниц):
// - запись/чтение на границах размеров, в т.ч. пустое значение;
// - перезапись большого значения маленьким и удаление возвращают страницы
//   цепочки в free set (файл не растёт на циклах перезаписи);
// - переоткрытие читает цепочки заново.
//
// Запуск:
//   cargo test --test bigdata -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{DbTable, StorageBuilder, TableKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-big-{prefix}-{pid}-{t}-{id}"))
}

fn pattern(n: usize, seed: u8) -> Vec<u8> {
    (0..n).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

const SIZES: &[usize] = &[0, 1, 100, 453, 454, 4000, 4096, 5000, 10_000, 100_000];

#[test]
fn values_of_many_sizes_survive_reopen() -> Result<()> {
    let root = unique_root("sizes");
    fs::create_dir_all(&root)?;
    let path = root.join("big.qlite");
    {
        let mut stg = StorageBuilder::from_default().build();
        stg.create(&path, false)?;
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "blobs", TableKind::BTree, 0)?;
        for (i, &n) in SIZES.iter().enumerate() {
            t.put(&tx, format!("size-{:07}", n).as_bytes(), &pattern(n, i as u8))?;
        }
        // в той же транзакции значения уже читаются
        assert_eq!(t.get(&tx, b"size-0010000")?, Some(pattern(10_000, 8)));
        tx.commit()?;
    }

    let mut stg = StorageBuilder::from_default().build();
    stg.open(&path)?;
    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "blobs")?.expect("blobs");
    for (i, &n) in SIZES.iter().enumerate() {
        let got = t.get(&tx, format!("size-{:07}", n).as_bytes())?;
        assert_eq!(got, Some(pattern(n, i as u8)), "value of {} bytes", n);
    }
    Ok(())
}

#[test]
fn overwrite_and_delete_recycle_chain_pages() -> Result<()> {
    let root = unique_root("recycle");
    fs::create_dir_all(&root)?;
    let mut stg = StorageBuilder::from_default().build();
    stg.create(root.join("big.qlite"), false)?;

    let big = pattern(64 * 1024, 3);
    let cycle = |stg: &QuiverLite::KvStorage| -> Result<()> {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "blobs", TableKind::BTree, 0)?;
        t.put(&tx, b"blob", &big)?;
        tx.commit()?;

        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "blobs", TableKind::BTree, 0)?;
        t.put(&tx, b"blob", b"small")?;
        assert_eq!(t.get(&tx, b"blob")?.as_deref(), Some(&b"small"[..]));
        tx.commit()?;

        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "blobs", TableKind::BTree, 0)?;
        assert!(t.delete(&tx, b"blob")?);
        tx.commit()
    };

    cycle(&stg)?;
    let pages = stg.stats()?.page_count;
    for _ in 0..10 {
        cycle(&stg)?;
    }
    let st = stg.stats()?;
    assert_eq!(st.page_count, pages, "chain pages must be reused");
    assert!(st.free_pages as u64 >= (big.len() / st.page_size) as u64);
    Ok(())
}

#[test]
fn big_values_in_hash_table() -> Result<()> {
    let root = unique_root("hash");
    fs::create_dir_all(&root)?;
    let mut stg = StorageBuilder::from_default().build();
    stg.create(root.join("big.qlite"), false)?;

    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "hblobs", TableKind::HashTable, 0)?;
    for i in 0..20u8 {
        t.put(&tx, &[b'h', i], &pattern(3000 + i as usize * 1000, i))?;
    }
    tx.commit()?;

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "hblobs")?.expect("hblobs");
    for i in 0..20u8 {
        assert_eq!(t.get(&tx, &[b'h', i])?, Some(pattern(3000 + i as usize * 1000, i)));
    }
    Ok(())
}
