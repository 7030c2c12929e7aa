// tests/errors.rs
//
// Типизированные ошибки (KvError внутри anyhow):
// - KeyTooLarge / KeySizeMismatch на ключах и на описании таблицы;
// - ReadOnly на записи в читающей транзакции и в read-only хранилище;
// - NotImplemented для push_front в BTree;
// - AlreadyExists при create поверх живой базы; overwrite=true пересоздаёт;
// - Usage: set_salt на открытом хранилище, несовпадение kind таблицы,
//   повторный open, транзакция на закрытом хранилище;
// - rollback отбрасывает изменения;
// - BadFormat на чужом файле; занятая блокировка.
//
// Запуск:
//   cargo test --test errors -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{DbTable, KvError, KvStorage, LiteConfig, StorageBuilder, TableKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-err-{prefix}-{pid}-{t}-{id}"))
}

fn kind<T>(r: Result<T>) -> KvError {
    let e = match r {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    match KvError::kind_of(&e) {
        Some(KvError::BadFormat(s)) => KvError::BadFormat(s.clone()),
        Some(KvError::Corrupt(s)) => KvError::Corrupt(s.clone()),
        Some(KvError::Usage(s)) => KvError::Usage(s.clone()),
        Some(KvError::ReadOnly) => KvError::ReadOnly,
        Some(KvError::NotImplemented(s)) => KvError::NotImplemented(*s),
        Some(KvError::AlreadyExists(s)) => KvError::AlreadyExists(s.clone()),
        Some(KvError::KeyTooLarge { len, max }) => KvError::KeyTooLarge { len: *len, max: *max },
        Some(KvError::KeySizeMismatch { expected, got }) => KvError::KeySizeMismatch {
            expected: *expected,
            got: *got,
        },
        other => panic!("unexpected error kind {:?}: {:#}", other, e),
    }
}

fn new_storage(prefix: &str) -> Result<(KvStorage, PathBuf)> {
    let root = unique_root(prefix);
    fs::create_dir_all(&root)?;
    let path = root.join("err.qlite");
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(&path, false)?;
    Ok((stg, path))
}

#[test]
fn key_limits() -> Result<()> {
    let (stg, _) = new_storage("keys")?;
    let tx = stg.begin_write()?;
    let var = DbTable::open(&tx, "var", TableKind::BTree, 0)?;
    let fixed = DbTable::open(&tx, "fixed", TableKind::BTree, 8)?;

    assert!(matches!(
        kind(var.put(&tx, &[1u8; 255], b"x")),
        KvError::KeyTooLarge { len: 255, max: 254 }
    ));
    var.put(&tx, &[1u8; 254], b"x")?;
    var.put(&tx, b"", b"empty key")?;
    assert_eq!(var.get(&tx, b"")?.as_deref(), Some(&b"empty key"[..]));

    assert!(matches!(
        kind(fixed.put(&tx, b"short", b"x")),
        KvError::KeySizeMismatch { expected: 8, got: 5 }
    ));
    assert!(matches!(
        kind(fixed.get(&tx, &[0u8; 9])),
        KvError::KeySizeMismatch { expected: 8, got: 9 }
    ));
    assert!(matches!(
        kind(DbTable::open(&tx, "huge", TableKind::BTree, 300)),
        KvError::KeyTooLarge { len: 300, max: 254 }
    ));
    tx.commit()?;
    Ok(())
}

#[test]
fn table_shape_mismatch_and_bad_names() -> Result<()> {
    let (stg, _) = new_storage("shape")?;
    let tx = stg.begin_write()?;
    DbTable::open(&tx, "t", TableKind::BTree, 4)?;
    assert!(matches!(
        kind(DbTable::open(&tx, "t", TableKind::HashTable, 4)),
        KvError::Usage(_)
    ));
    assert!(matches!(
        kind(DbTable::open(&tx, "t", TableKind::BTree, 8)),
        KvError::KeySizeMismatch { expected: 4, got: 8 }
    ));
    assert!(matches!(
        kind(DbTable::open(&tx, "", TableKind::BTree, 0)),
        KvError::Usage(_)
    ));
    assert!(matches!(
        kind(DbTable::open(&tx, &"n".repeat(255), TableKind::BTree, 0)),
        KvError::KeyTooLarge { .. }
    ));
    tx.commit()?;
    Ok(())
}

#[test]
fn read_only_violations() -> Result<()> {
    let (mut stg, path) = new_storage("ro")?;
    {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
        t.put(&tx, b"k", b"v")?;
        tx.commit()?;
    }

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "t")?.expect("t");
    assert!(matches!(kind(t.put(&tx, b"k", b"w")), KvError::ReadOnly));
    assert!(matches!(kind(t.delete(&tx, b"k")), KvError::ReadOnly));
    assert!(matches!(
        kind(DbTable::open(&tx, "fresh", TableKind::BTree, 0)),
        KvError::ReadOnly
    ));
    assert!(matches!(kind(DbTable::drop(&tx, "t")), KvError::ReadOnly));
    tx.rollback()?;
    stg.close()?;

    let mut ro = StorageBuilder::from_default().read_only(true).build();
    ro.open(&path)?;
    assert!(matches!(kind(ro.begin_write()), KvError::ReadOnly));
    assert!(matches!(kind(ro.checkpoint()), KvError::ReadOnly));
    assert!(matches!(kind(ro.set_user_version(3)), KvError::ReadOnly));
    assert!(matches!(kind(ro.vacuum()), KvError::ReadOnly));
    assert!(matches!(kind(ro.create(&path, true)), KvError::Usage(_)));
    Ok(())
}

#[test]
fn push_front_is_hash_only() -> Result<()> {
    let (stg, _) = new_storage("push")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "tree", TableKind::BTree, 0)?;
    assert!(matches!(
        kind(t.push_front(&tx, b"k", b"v")),
        KvError::NotImplemented(_)
    ));
    tx.commit()?;
    Ok(())
}

#[test]
fn create_over_existing_database() -> Result<()> {
    let (mut stg, path) = new_storage("exists")?;
    stg.set_user_version(9)?;
    stg.close()?;

    let mut again = KvStorage::with_config(LiteConfig::default());
    assert!(matches!(kind(again.create(&path, false)), KvError::AlreadyExists(_)));
    assert!(!again.is_open());

    again.create(&path, true)?;
    assert_eq!(again.user_version()?, 0);
    let tx = again.begin_read()?;
    assert!(tx.table_names()?.is_empty());
    Ok(())
}

#[test]
fn usage_errors() -> Result<()> {
    let (mut stg, path) = new_storage("usage")?;
    assert!(matches!(kind(stg.set_salt(1)), KvError::Usage(_)));
    assert!(matches!(kind(stg.open(&path)), KvError::Usage(_)));

    let mut closed = KvStorage::with_config(LiteConfig::default());
    assert!(matches!(kind(closed.begin_read()), KvError::Usage(_)));
    assert!(matches!(kind(closed.stats()), KvError::Usage(_)));
    closed.set_salt(0xABCD)?;
    assert_eq!(closed.salt()?, Some(0xABCD));

    // второй writer на тот же файл: блокировка занята
    assert!(matches!(kind(closed.open(&path)), KvError::Usage(_)));

    stg.close()?;
    assert!(!stg.is_open());
    assert!(matches!(kind(stg.begin_write()), KvError::Usage(_)));
    Ok(())
}

#[test]
fn rollback_discards_writes() -> Result<()> {
    let (stg, _) = new_storage("finished")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
    t.put(&tx, b"a", b"1")?;
    tx.commit()?;

    let tx2 = stg.begin_write()?;
    let t2 = DbTable::open_existing(&tx2, "t")?.expect("t");
    t2.put(&tx2, b"b", b"2")?;
    tx2.rollback()?;

    let tx3 = stg.begin_read()?;
    let t3 = DbTable::open_existing(&tx3, "t")?.expect("t");
    assert_eq!(t3.get(&tx3, b"a")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(t3.get(&tx3, b"b")?, None, "rolled back write must vanish");
    Ok(())
}

#[test]
fn garbage_file_is_bad_format() -> Result<()> {
    let root = unique_root("garbage");
    fs::create_dir_all(&root)?;
    let path = root.join("not-a-db.bin");
    fs::write(&path, vec![0x5Au8; 8192])?;

    let mut stg = KvStorage::with_config(LiteConfig::default());
    assert!(matches!(kind(stg.open(&path)), KvError::BadFormat(_)));
    // неудачный open файл не трогает
    assert_eq!(fs::read(&path)?, vec![0x5Au8; 8192]);

    fs::write(&path, b"tiny")?;
    assert!(matches!(kind(stg.open(&path)), KvError::BadFormat(_)));
    Ok(())
}
