// tests/scenario.rs
//
// Сквозной сценарий:
// - create + таблица "T" (variable keys) + "a","b" и 10KB blob в "c";
// - переоткрытие read-only: seek_first -> "a", seek_key("c") -> blob целиком;
// - удаление "b" в новой транзакции; освобождённые страницы становятся
//   свободными только после закрытия читателя, державшего старый снимок.
//
// Запуск:
//   cargo test --test scenario -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{DbTable, LiteConfig, StorageBuilder, TableKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-scn-{prefix}-{pid}-{t}-{id}"))
}

fn blob(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn create_fill_reopen_read_only() -> Result<()> {
    let root = unique_root("ro");
    fs::create_dir_all(&root)?;
    let path = root.join("scenario.qlite");
    let big = blob(10 * 1024);

    {
        let mut stg = StorageBuilder::from_default().build();
        stg.create(&path, false)?;
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "T", TableKind::BTree, 0)?;
        t.put(&tx, b"a", b"1")?;
        t.put(&tx, b"b", b"2")?;
        t.put(&tx, b"c", &big)?;
        tx.commit()?;
        stg.close()?;
    }

    let mut ro = StorageBuilder::from_default().read_only(true).build();
    ro.open(&path)?;
    let tx = ro.begin_read()?;
    let t = DbTable::open_existing(&tx, "T")?.expect("table T must exist");
    assert_eq!(t.kind(), TableKind::BTree);
    assert_eq!(t.key_size(), 0);

    let c = t.cursor(&tx)?;
    assert!(c.seek_first()?);
    assert_eq!(c.key()?.as_deref(), Some(&b"a"[..]));
    assert_eq!(c.data()?.as_deref(), Some(&b"1"[..]));

    assert!(c.seek_key(b"c")?);
    let got = c.data()?.expect("value for c");
    assert_eq!(got.len(), big.len());
    assert_eq!(got, big);

    // запись в read-only хранилище запрещена
    assert!(ro.begin_write().is_err());
    drop(c);
    tx.commit()?;
    Ok(())
}

#[test]
fn delete_frees_pages_only_after_reader_closes() -> Result<()> {
    let root = unique_root("reclaim");
    fs::create_dir_all(&root)?;
    let path = root.join("scenario.qlite");

    let mut stg = StorageBuilder::from_default()
        .config(LiteConfig::default().with_durability(true))
        .build();
    stg.create(&path, false)?;
    {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "T", TableKind::BTree, 0)?;
        t.put(&tx, b"a", b"1")?;
        t.put(&tx, b"b", b"2")?;
        t.put(&tx, b"c", &blob(10 * 1024))?;
        tx.commit()?;
    }

    let reader = stg.begin_read()?;
    let rt = DbTable::open_existing(&reader, "T")?.expect("T");
    assert_eq!(rt.get(&reader, b"b")?.as_deref(), Some(&b"2"[..]));

    {
        let tx = stg.begin_write()?;
        let t = DbTable::open_existing(&tx, "T")?.expect("T");
        assert!(t.delete(&tx, b"b")?);
        assert!(!t.delete(&tx, b"b")?);
        tx.commit()?;
    }

    // старый снимок всё ещё видит "b"
    assert_eq!(rt.get(&reader, b"b")?.as_deref(), Some(&b"2"[..]));
    let st = stg.stats()?;
    assert!(
        st.reader_locked_pages > 0,
        "pages released under an open reader must be reader-locked"
    );
    let free_before = st.free_pages;

    reader.commit()?;
    let st = stg.stats()?;
    assert_eq!(st.reader_locked_pages, 0);
    assert!(st.free_pages > free_before, "released pages must return to the free set");

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "T")?.expect("T");
    assert_eq!(t.get(&tx, b"b")?, None);
    assert_eq!(t.get(&tx, b"a")?.as_deref(), Some(&b"1"[..]));
    Ok(())
}
