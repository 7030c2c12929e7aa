use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

use QuiverLite::{KvStorage, LiteConfig};

/// Открыть хранилище из env-конфига (QL_*), при необходимости read-only.
pub fn open_storage(path: &Path, read_only: bool) -> Result<KvStorage> {
    let mut cfg = LiteConfig::from_env();
    if read_only {
        cfg.read_only = true;
    }
    let mut stg = KvStorage::with_config(cfg);
    stg.open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(stg)
}

pub fn read_all(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

/// Значение из аргумента: `-` (stdin), `@file`, `hex:..` или литерал.
pub fn decode_value_arg(arg: &str) -> Result<Vec<u8>> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    if let Some(p) = arg.strip_prefix('@') {
        return read_all(&PathBuf::from(p));
    }
    if let Some(hx) = arg.strip_prefix("hex:") {
        return decode_hex(hx);
    }
    Ok(arg.as_bytes().to_vec())
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex value has odd length {}", s.len()));
    }
    s.as_bytes()
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|d| u8::from_str_radix(d, 16).ok())
                .ok_or_else(|| anyhow!("bad hex digit pair at offset {}", i * 2))
        })
        .collect()
}

pub fn to_hex(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect()
}
