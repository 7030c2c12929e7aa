// src/meta.rs — header page (4096 B) базы QuiverLite
//
// Header page содержит ДВА слота по 2048 байт (ping-pong). Каждый слот (LE):
//   [0..8)     MAGIC8 = "QLDBHDR1"
//   [8..12)    u32 version        = 1
//   [12..16)   u32 page_size      (4 KiB..=32 KiB, power of two)
//   [16..20)   u32 salt
//   [20..24)   u32 user_version   (major<<16 | minor)
//   [24..32)   u64 last_txid      (последняя durable транзакция)
//   [32..40)   u64 seq            (номер записи заголовка, растёт на каждом checkpoint)
//   [40..44)   u32 page_count     (страниц в файле, включая страницу 0)
//   [44..48)   u32 main_root      (корень каталога таблиц, 0 = пусто)
//   [48..52)   u32 free_pages     (сводка: сколько страниц было свободно на checkpoint)
//   [52]       u8  app_name_len
//   [53..117)  app_name (<= 64 B)
//   [2044..2048) u32 crc32 по [0..2044)
//
// Политика:
// - Запись идёт в слот seq % 2, т.е. всегда НЕ в слот с последним валидным заголовком.
// - При чтении берётся валидный (magic+version+crc) слот с наибольшим seq.
//   Порванная запись одного слота не теряет предыдущее durable состояние.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;

use crate::consts::{
    DB_FORMAT_VERSION, DB_MAGIC, HEADER_PAGE_SIZE, HEADER_SLOT_SIZE, MAX_APP_NAME, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE,
};
use crate::error::KvError;
use crate::util::{read_at, write_at};

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_PAGE_SIZE: usize = 12;
const OFF_SALT: usize = 16;
const OFF_USER_VERSION: usize = 20;
const OFF_LAST_TXID: usize = 24;
const OFF_SEQ: usize = 32;
const OFF_PAGE_COUNT: usize = 40;
const OFF_MAIN_ROOT: usize = 44;
const OFF_FREE_PAGES: usize = 48;
const OFF_APP_LEN: usize = 52;
const OFF_APP_NAME: usize = 53;
const OFF_CRC: usize = HEADER_SLOT_SIZE - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub version: u32,
    pub page_size: u32,
    pub salt: u32,
    pub user_version: u32,
    pub last_txid: u64,
    pub seq: u64,
    pub page_count: u32,
    pub main_root: u32,
    pub free_pages: u32,
    pub app_name: String,
}

impl Default for DbHeader {
    fn default() -> Self {
        Self {
            version: DB_FORMAT_VERSION,
            page_size: 4096,
            salt: 0,
            user_version: 0,
            last_txid: 0,
            seq: 0,
            page_count: 1,
            main_root: 0,
            free_pages: 0,
            app_name: String::new(),
        }
    }
}

/// Упаковать версию (major, minor) в u32 user_version.
#[inline]
pub fn pack_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

#[inline]
pub fn unpack_version(v: u32) -> (u16, u16) {
    ((v >> 16) as u16, (v & 0xFFFF) as u16)
}

/// Проверка корректности размера страницы (2^n, 4 KiB .. 32 KiB).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    let ps = page_size as usize;
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) || !ps.is_power_of_two() {
        return Err(anyhow::Error::new(KvError::BadFormat(format!(
            "page_size must be a power of two in [{} .. {}], got {}",
            MIN_PAGE_SIZE, MAX_PAGE_SIZE, page_size
        ))));
    }
    Ok(())
}

// ---- Кодек одного слота ----

pub fn encode_slot(h: &DbHeader) -> Result<Vec<u8>> {
    let name = h.app_name.as_bytes();
    if name.len() > MAX_APP_NAME {
        return Err(KvError::usage(format!(
            "app name too long: {} > {}",
            name.len(),
            MAX_APP_NAME
        )));
    }
    let mut s = vec![0u8; HEADER_SLOT_SIZE];
    s[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(DB_MAGIC);
    LittleEndian::write_u32(&mut s[OFF_VERSION..OFF_VERSION + 4], h.version);
    LittleEndian::write_u32(&mut s[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4], h.page_size);
    LittleEndian::write_u32(&mut s[OFF_SALT..OFF_SALT + 4], h.salt);
    LittleEndian::write_u32(&mut s[OFF_USER_VERSION..OFF_USER_VERSION + 4], h.user_version);
    LittleEndian::write_u64(&mut s[OFF_LAST_TXID..OFF_LAST_TXID + 8], h.last_txid);
    LittleEndian::write_u64(&mut s[OFF_SEQ..OFF_SEQ + 8], h.seq);
    LittleEndian::write_u32(&mut s[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4], h.page_count);
    LittleEndian::write_u32(&mut s[OFF_MAIN_ROOT..OFF_MAIN_ROOT + 4], h.main_root);
    LittleEndian::write_u32(&mut s[OFF_FREE_PAGES..OFF_FREE_PAGES + 4], h.free_pages);
    s[OFF_APP_LEN] = name.len() as u8;
    s[OFF_APP_NAME..OFF_APP_NAME + name.len()].copy_from_slice(name);
    let crc = crc32fast::hash(&s[..OFF_CRC]);
    LittleEndian::write_u32(&mut s[OFF_CRC..OFF_CRC + 4], crc);
    Ok(s)
}

/// Разобрать слот. Ok(None) — слот пуст (нулевой) или порван (CRC).
/// Err — magic/версия чужие (формат не наш).
pub fn decode_slot(s: &[u8]) -> Result<Option<DbHeader>> {
    if s.len() < HEADER_SLOT_SIZE {
        return Err(anyhow!("header slot too small: {}", s.len()));
    }
    if s[..HEADER_SLOT_SIZE].iter().all(|&b| b == 0) {
        return Ok(None);
    }
    if &s[OFF_MAGIC..OFF_MAGIC + 8] != DB_MAGIC {
        return Err(anyhow::Error::new(KvError::BadFormat(format!(
            "bad header magic {:?}",
            &s[OFF_MAGIC..OFF_MAGIC + 8]
        ))));
    }
    let stored = LittleEndian::read_u32(&s[OFF_CRC..OFF_CRC + 4]);
    if stored != crc32fast::hash(&s[..OFF_CRC]) {
        return Ok(None);
    }
    let version = LittleEndian::read_u32(&s[OFF_VERSION..OFF_VERSION + 4]);
    if version != DB_FORMAT_VERSION {
        return Err(anyhow::Error::new(KvError::BadFormat(format!(
            "unsupported format version {} (expected {})",
            version, DB_FORMAT_VERSION
        ))));
    }
    let name_len = (s[OFF_APP_LEN] as usize).min(MAX_APP_NAME);
    let app_name = String::from_utf8_lossy(&s[OFF_APP_NAME..OFF_APP_NAME + name_len]).into_owned();
    Ok(Some(DbHeader {
        version,
        page_size: LittleEndian::read_u32(&s[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4]),
        salt: LittleEndian::read_u32(&s[OFF_SALT..OFF_SALT + 4]),
        user_version: LittleEndian::read_u32(&s[OFF_USER_VERSION..OFF_USER_VERSION + 4]),
        last_txid: LittleEndian::read_u64(&s[OFF_LAST_TXID..OFF_LAST_TXID + 8]),
        seq: LittleEndian::read_u64(&s[OFF_SEQ..OFF_SEQ + 8]),
        page_count: LittleEndian::read_u32(&s[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4]),
        main_root: LittleEndian::read_u32(&s[OFF_MAIN_ROOT..OFF_MAIN_ROOT + 4]),
        free_pages: LittleEndian::read_u32(&s[OFF_FREE_PAGES..OFF_FREE_PAGES + 4]),
        app_name,
    }))
}

/// Выбрать актуальный заголовок из полной header page (4096 B).
pub fn decode_header_page(page: &[u8]) -> Result<DbHeader> {
    if page.len() < HEADER_PAGE_SIZE {
        return Err(anyhow::Error::new(KvError::BadFormat(format!(
            "file too small for header page: {} bytes",
            page.len()
        ))));
    }
    let a = decode_slot(&page[..HEADER_SLOT_SIZE])?;
    let b = decode_slot(&page[HEADER_SLOT_SIZE..HEADER_PAGE_SIZE])?;
    let h = match (a, b) {
        (Some(a), Some(b)) => {
            if b.seq > a.seq {
                b
            } else {
                a
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return Err(KvError::corrupt("no valid header slot (both torn)")),
    };
    validate_page_size(h.page_size)?;
    if h.page_count == 0 {
        return Err(KvError::corrupt("header page_count is zero"));
    }
    Ok(h)
}

/// Прочитать header page с диска и выбрать актуальный слот.
pub fn read_header(f: &File) -> Result<DbHeader> {
    let len = f.metadata().context("stat database file")?.len();
    if len < HEADER_PAGE_SIZE as u64 {
        return Err(anyhow::Error::new(KvError::BadFormat(format!(
            "file too small for header page: {} bytes",
            len
        ))));
    }
    let mut page = vec![0u8; HEADER_PAGE_SIZE];
    read_at(f, 0, &mut page).context("read header page")?;
    decode_header_page(&page)
}

/// Записать заголовок в слот seq % 2 (без fsync — это решает вызывающий).
pub fn write_header(f: &File, h: &DbHeader) -> Result<()> {
    let slot = encode_slot(h)?;
    let off = (h.seq % 2) * HEADER_SLOT_SIZE as u64;
    write_at(f, off, &slot).context("write header slot")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> DbHeader {
        DbHeader {
            page_size: 8192,
            salt: 0xDEAD_BEEF,
            user_version: pack_version(2, 7),
            last_txid: 40 + seq,
            seq,
            page_count: 77,
            main_root: 5,
            free_pages: 3,
            app_name: "unit".into(),
            ..DbHeader::default()
        }
    }

    #[test]
    fn newest_slot_wins() {
        let mut page = vec![0u8; HEADER_PAGE_SIZE];
        let h1 = sample(1);
        let h2 = sample(2);
        page[HEADER_SLOT_SIZE..].copy_from_slice(&encode_slot(&h1).unwrap());
        page[..HEADER_SLOT_SIZE].copy_from_slice(&encode_slot(&h2).unwrap());
        let got = decode_header_page(&page).unwrap();
        assert_eq!(got, h2);
        assert_eq!(unpack_version(got.user_version), (2, 7));
    }

    #[test]
    fn torn_slot_falls_back_to_previous() {
        let mut page = vec![0u8; HEADER_PAGE_SIZE];
        let h1 = sample(1);
        let h2 = sample(2);
        page[HEADER_SLOT_SIZE..].copy_from_slice(&encode_slot(&h1).unwrap());
        page[..HEADER_SLOT_SIZE].copy_from_slice(&encode_slot(&h2).unwrap());
        // порвём слот с seq=2
        page[OFF_LAST_TXID] ^= 0xFF;
        let got = decode_header_page(&page).unwrap();
        assert_eq!(got, h1);
    }

    #[test]
    fn foreign_magic_is_bad_format() {
        let mut page = vec![0u8; HEADER_PAGE_SIZE];
        page[..8].copy_from_slice(b"NOTADBXX");
        let err = decode_header_page(&page).unwrap_err();
        assert!(matches!(KvError::kind_of(&err), Some(KvError::BadFormat(_))));
    }

    #[test]
    fn page_size_validation() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(32768).is_ok());
        assert!(validate_page_size(65536).is_err());
        assert!(validate_page_size(5000).is_err());
    }
}
