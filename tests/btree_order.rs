// tests/btree_order.rs
//
// Порядок обхода BTree:
// - случайные вставки -> прямой обход возвращает ключи по возрастанию,
//   обратный — по убыванию;
// - fixed-size ключи (u64 BE) упорядочены как числа;
// - seek_key на отсутствующем ключе встаёт на ближайший больший;
// - массовые удаления (с merge/redistribute) не ломают порядок, переоткрытие
//   видит то же содержимое.
//
// Запуск:
//   cargo test --test btree_order -- --nocapture

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use QuiverLite::{CursorPos, DbTable, KvStorage, LiteConfig, TableKind, Transaction};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qlitetest-order-{prefix}-{pid}-{t}-{id}"))
}

fn forward(tx: &Transaction<'_>, t: &DbTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let c = t.cursor(tx)?;
    let mut out = Vec::new();
    let mut more = c.seek(CursorPos::First)?;
    while more {
        out.push((c.key()?.expect("key"), c.data()?.expect("data")));
        more = c.seek(CursorPos::Next)?;
    }
    assert!(c.is_eof()?);
    Ok(out)
}

fn backward(tx: &Transaction<'_>, t: &DbTable) -> Result<Vec<Vec<u8>>> {
    let c = t.cursor(tx)?;
    let mut out = Vec::new();
    let mut more = c.seek(CursorPos::Last)?;
    while more {
        out.push(c.key()?.expect("key"));
        more = c.seek(CursorPos::Prev)?;
    }
    Ok(out)
}

#[test]
fn random_variable_keys_iterate_sorted() -> Result<()> {
    let root = unique_root("var");
    fs::create_dir_all(&root)?;
    let path = root.join("order.qlite");
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(&path, false)?;

    let mut rng = oorandom::Rand64::new(0x5eed_0001);
    let mut model = BTreeMap::new();
    {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "words", TableKind::BTree, 0)?;
        for _ in 0..3000 {
            let klen = 1 + rng.rand_range(0..40) as usize;
            let k: Vec<u8> = (0..klen).map(|_| b'a' + rng.rand_range(0..26) as u8).collect();
            let vlen = rng.rand_range(0..200) as usize;
            let v: Vec<u8> = (0..vlen).map(|_| rng.rand_u64() as u8).collect();
            t.put(&tx, &k, &v)?;
            model.insert(k, v);
        }
        tx.commit()?;
    }

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "words")?.expect("words");
    let got = forward(&tx, &t)?;
    let want: Vec<(Vec<u8>, Vec<u8>)> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(got.len(), want.len());
    assert_eq!(got, want);

    let mut rev = backward(&tx, &t)?;
    rev.reverse();
    let keys: Vec<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(rev, keys);
    Ok(())
}

#[test]
fn fixed_size_keys_order_numerically() -> Result<()> {
    let root = unique_root("fixed");
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(root.join("order.qlite"), false)?;

    let mut rng = oorandom::Rand64::new(42);
    let mut ids: Vec<u64> = (0..2000).map(|_| rng.rand_u64()).collect();
    {
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "ids", TableKind::BTree, 8)?;
        for id in &ids {
            t.put(&tx, &id.to_be_bytes(), &id.to_le_bytes())?;
        }
        tx.commit()?;
    }
    ids.sort_unstable();
    ids.dedup();

    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "ids")?.expect("ids");
    assert_eq!(t.key_size(), 8);
    let got: Vec<u64> = forward(&tx, &t)?
        .into_iter()
        .map(|(k, v)| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&k);
            let id = u64::from_be_bytes(a);
            assert_eq!(v, id.to_le_bytes().to_vec());
            id
        })
        .collect();
    assert_eq!(got, ids);
    Ok(())
}

#[test]
fn seek_key_lands_on_next_greater() -> Result<()> {
    let root = unique_root("seek");
    fs::create_dir_all(&root)?;
    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.create(root.join("order.qlite"), false)?;

    let tx = stg.begin_write()?;
    let t = DbTable::open(&tx, "gaps", TableKind::BTree, 0)?;
    for i in (0..500u32).map(|i| i * 10) {
        t.put(&tx, format!("{:06}", i).as_bytes(), b"x")?;
    }
    let c = t.cursor(&tx)?;
    assert!(!c.seek_key(b"000015")?);
    assert_eq!(c.key()?.as_deref(), Some(&b"000020"[..]));
    assert!(c.seek_key(b"000020")?);
    assert_eq!(c.key()?.as_deref(), Some(&b"000020"[..]));
    // за последним ключом — EOF
    assert!(!c.seek_key(b"999999")?);
    assert!(c.is_eof()?);
    assert_eq!(c.key()?, None);
    drop(c);
    tx.commit()?;
    Ok(())
}

#[test]
fn mass_delete_keeps_order_across_reopen() -> Result<()> {
    let root = unique_root("delete");
    fs::create_dir_all(&root)?;
    let path = root.join("order.qlite");
    let mut model = BTreeMap::new();
    {
        let mut stg = KvStorage::with_config(LiteConfig::default());
        stg.create(&path, false)?;
        let mut rng = oorandom::Rand64::new(7);
        let tx = stg.begin_write()?;
        let t = DbTable::open(&tx, "churn", TableKind::BTree, 0)?;
        for i in 0..4000u32 {
            let k = format!("k{:08}", i).into_bytes();
            let v = vec![(i % 251) as u8; 16 + (i % 64) as usize];
            t.put(&tx, &k, &v)?;
            model.insert(k, v);
        }
        tx.commit()?;

        // удаляем ~3/4 ключей в случайном порядке
        let mut doomed: Vec<Vec<u8>> = model.keys().cloned().collect();
        for i in (1..doomed.len()).rev() {
            let j = rng.rand_range(0..(i as u64 + 1)) as usize;
            doomed.swap(i, j);
        }
        doomed.truncate(3000);
        let tx = stg.begin_write()?;
        let t = DbTable::open_existing(&tx, "churn")?.expect("churn");
        for k in &doomed {
            assert!(t.delete(&tx, k)?, "key must exist before delete");
            model.remove(k);
        }
        tx.commit()?;
        stg.close()?;
    }

    let mut stg = KvStorage::with_config(LiteConfig::default());
    stg.open(&path)?;
    let tx = stg.begin_read()?;
    let t = DbTable::open_existing(&tx, "churn")?.expect("churn");
    let got = forward(&tx, &t)?;
    let want: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(got, want);
    Ok(())
}
