// tests/mvcc_readers.rs
//
// Снимки читателей:
// - читатель видит состояние на момент begin, не замечая последующих коммитов;
// - несколько потоков-читателей параллельно с писателем всегда видят
//   согласованный снимок (все ключи одной версии);
// - после ухода всех читателей освобождённые страницы снова выдаются,
//   файл не растёт на повторных перезаписях.
//
// Запуск:
//   cargo test --test mvcc_readers -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{DbTable, KvStorage, LiteConfig, TableKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-mvcc-{prefix}-{pid}-{t}-{id}"))
}

const KEYS: usize = 200;

fn key(i: usize) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

fn write_version(stg: &KvStorage, ver: u64) -> Result<()> {
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "versions", TableKind::BTree, 0)?;
    let val = format!("v{:08}", ver).into_bytes();
    for i in 0..KEYS {
        t.put(&tx, &key(i), &val)?;
    }
    tx.commit()
}

fn read_version(stg: &KvStorage) -> Result<Option<String>> {
    let tx = stg.begin_read()?;
    let Some(t) = DbTable::open_existing(&tx, "versions")? else {
        return Ok(None);
    };
    let c = t.cursor(&tx)?;
    let mut seen: Option<Vec<u8>> = None;
    let mut n = 0usize;
    let mut more = c.seek_first()?;
    while more {
        let v = c.data()?.expect("positioned cursor has data");
        if let Some(prev) = &seen {
            assert_eq!(prev, &v, "mixed versions inside one snapshot");
        }
        seen = Some(v);
        n += 1;
        more = c.seek_next()?;
    }
    assert_eq!(n, KEYS, "snapshot must hold every key");
    Ok(seen.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

#[test]
fn reader_keeps_its_snapshot() -> Result<()> {
    let root = unique_root("snapshot");
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default().with_durability(false));
    stg.create(root.join("mvcc.qlite"), false)?;

    write_version(&stg, 1)?;
    let reader = stg.begin_read()?;
    let snap = reader.snapshot_txid();
    write_version(&stg, 2)?;
    write_version(&stg, 3)?;

    let t = DbTable::open_existing(&reader, "versions")?.expect("table");
    assert_eq!(t.get(&reader, &key(7))?.as_deref(), Some(&b"v00000001"[..]));
    assert_eq!(reader.snapshot_txid(), snap);
    reader.rollback()?;

    assert_eq!(read_version(&stg)?.as_deref(), Some("v00000003"));
    Ok(())
}

#[test]
fn concurrent_readers_see_consistent_snapshots() -> Result<()> {
    let root = unique_root("threads");
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default().with_durability(false));
    stg.create(root.join("mvcc.qlite"), false)?;
    write_version(&stg, 0)?;

    let done = AtomicBool::new(false);
    let stg_ref = &stg;
    std::thread::scope(|s| -> Result<()> {
        let mut readers = Vec::new();
        for _ in 0..4 {
            readers.push(s.spawn(|| -> Result<u64> {
                let mut rounds = 0u64;
                loop {
                    read_version(stg_ref)?;
                    rounds += 1;
                    if done.load(Ordering::Acquire) {
                        return Ok(rounds);
                    }
                }
            }));
        }
        let written = (1..=30).try_for_each(|ver| write_version(stg_ref, ver));
        done.store(true, Ordering::Release);
        for r in readers {
            let rounds = r.join().expect("reader thread panicked")?;
            assert!(rounds > 0);
        }
        written
    })?;

    assert_eq!(read_version(&stg)?.as_deref(), Some("v00000030"));
    let st = stg.stats()?;
    assert_eq!(st.readers, 0);
    assert_eq!(st.reader_locked_pages, 0);
    Ok(())
}

#[test]
fn released_pages_are_reused_without_readers() -> Result<()> {
    let root = unique_root("reuse");
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(root.join("mvcc.qlite"), false)?;

    write_version(&stg, 0)?;
    write_version(&stg, 1)?;
    let pages_after_warmup = stg.stats()?.page_count;
    for ver in 2..50 {
        write_version(&stg, ver)?;
    }
    let st = stg.stats()?;
    assert_eq!(
        st.page_count, pages_after_warmup,
        "steady-state rewrites must recycle released pages"
    );
    assert!(st.free_pages > 0);
    Ok(())
}
