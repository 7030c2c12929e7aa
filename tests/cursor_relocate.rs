// tests/cursor_relocate.rs
//
// Несколько курсоров на одной таблице в одной транзакции:
// - удаление через один курсор: второй, стоявший на удалённой записи,
//   встаёт на следующую и помечен deleted; seek_next отдаёт её без сдвига
//   (в hash-таблице следующей нет, курсор уходит в EOF);
// - вставки со сплитами страниц не сбивают позицию других курсоров;
// - delete на последней записи переводит курсор в EOF;
// - drop_table через курсор: таблица пуста, запись через старый курсор — Usage.
//
// Запуск:
//   cargo test --test cursor_relocate -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{DbTable, KvError, KvStorage, LiteConfig, TableKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-cur-{prefix}-{pid}-{t}-{id}"))
}

fn new_storage(prefix: &str) -> Result<KvStorage> {
    let root = unique_root(prefix);
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(root.join("cur.qlite"), false)?;
    Ok(stg)
}

fn k(i: u32) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

#[test]
fn second_cursor_moves_to_successor_after_delete() -> Result<()> {
    let stg = new_storage("succ")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
    for i in 0..100 {
        t.put(&tx, &k(i), b"v")?;
    }

    let a = t.cursor(&tx)?;
    let b = t.cursor(&tx)?;
    assert!(a.seek_key(&k(42))?);
    assert!(b.seek_key(&k(42))?);

    a.delete()?;
    assert!(a.is_deleted()?);
    assert!(b.is_deleted()?, "other cursor must notice the delete");
    // удалённая позиция не отдаёт ключ
    assert_eq!(a.key()?, None);
    assert_eq!(b.key()?, None);

    // seek_next после delete возвращает следующую запись без сдвига
    assert!(a.seek_next()?);
    assert!(b.seek_next()?);
    assert_eq!(a.key()?, Some(k(43)));
    assert_eq!(b.key()?, Some(k(43)));
    assert!(!b.is_deleted()?);

    assert_eq!(t.get(&tx, &k(42))?, None);
    drop(a);
    drop(b);
    tx.commit()?;
    Ok(())
}

#[test]
fn hash_cursor_loses_deleted_key() -> Result<()> {
    let stg = new_storage("hash")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "t", TableKind::HashTable, 0)?;
    for i in 0..100 {
        t.put(&tx, &k(i), b"v")?;
    }
    let a = t.cursor(&tx)?;
    let b = t.cursor(&tx)?;
    assert!(a.seek_key(&k(7))?);
    assert!(b.seek_key(&k(7))?);
    a.delete()?;

    // в hash-таблице у удалённого ключа нет «следующего»: второй курсор в EOF
    assert!(b.is_deleted()?);
    assert!(!b.seek_next()?);
    assert!(b.is_eof()?);
    // первый курсор продолжает обход в порядке бакетов
    if a.seek_next()? {
        assert_ne!(a.key()?, Some(k(7)));
    }
    assert!(b.seek_key(&k(8))?);
    Ok(())
}

#[test]
fn splits_do_not_lose_other_cursor() -> Result<()> {
    let stg = new_storage("split")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
    for i in (0..200).map(|i| i * 10) {
        t.put(&tx, &k(i), &[1u8; 64])?;
    }
    let reader = t.cursor(&tx)?;
    let writer = t.cursor(&tx)?;
    assert!(reader.seek_key(&k(1000))?);

    // много вставок вокруг позиции читателя -> сплиты и COW страниц
    for i in 0..2000 {
        if i % 10 != 0 {
            writer.put(&k(i), &[2u8; 64], false)?;
        }
    }
    assert_eq!(reader.key()?, Some(k(1000)));
    assert!(!reader.is_deleted()?);
    assert!(reader.seek_next()?);
    assert_eq!(reader.key()?, Some(k(1001)));
    assert!(reader.seek_prev()?);
    assert!(reader.seek_prev()?);
    assert_eq!(reader.key()?, Some(k(999)));
    assert_eq!(reader.data()?, Some(vec![2u8; 64]));
    Ok(())
}

#[test]
fn delete_last_goes_eof() -> Result<()> {
    let stg = new_storage("eof")?;
    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
    for i in 0..10 {
        t.put(&tx, &k(i), b"v")?;
    }
    let c = t.cursor(&tx)?;
    assert!(c.seek_last()?);
    c.delete()?;
    assert!(c.is_eof()?);
    assert!(!c.seek_next()?);
    assert!(c.seek_last()?);
    assert_eq!(c.key()?, Some(k(8)));

    // удалить всё по одной записи с начала
    let mut n = 0;
    let mut more = c.seek_first()?;
    while more {
        c.delete()?;
        n += 1;
        more = c.seek_next()?;
    }
    assert_eq!(n, 9);
    assert!(!c.seek_first()?);
    Ok(())
}

#[test]
fn drop_table_through_cursor() -> Result<()> {
    let stg = new_storage("drop")?;
    {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
        for i in 0..300 {
            t.put(&tx, &k(i), &[0u8; 32])?;
        }
        tx.commit()?;
    }
    let tx = stg.begin_write()?;
    let t = DbTable::open_existing(&tx, "t")?.expect("t");
    let c = t.cursor(&tx)?;
    assert!(c.seek_first()?);
    c.drop_table()?;
    let err = c.put(b"x", b"y", false).unwrap_err();
    assert!(matches!(KvError::kind_of(&err), Some(KvError::Usage(_))));
    drop(c);
    assert!(tx.table_names()?.is_empty());

    // открыть заново в той же транзакции — пустая таблица
    let t2 = DbTable::open(&tx, "t", TableKind::BTree, 0)?;
    assert_eq!(t2.get(&tx, &k(1))?, None);
    t2.put(&tx, &k(1), b"new")?;
    tx.commit()?;

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "t")?.expect("t");
    assert_eq!(t.get(&tx, &k(1))?.as_deref(), Some(&b"new"[..]));
    assert_eq!(t.get(&tx, &k(2))?, None);
    Ok(())
}
