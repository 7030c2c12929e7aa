//! Межпроцессная блокировка файла базы.
//!
//! Cross-platform (fs2) advisory locks на side-car файле `<db>-lock`:
//! - Exclusive: открытие на запись (один процесс-писатель).
//! - Shared: read-only открытия, сколько угодно одновременно.
//!
//! Блокировка берётся без ожидания: занятая база — ошибка Usage, а не зависание.
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::KvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn lock_file_path(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_owned();
    s.push("-lock");
    PathBuf::from(s)
}

/// Взять блокировку базы `db_path` в нужном режиме (без ожидания).
pub fn try_lock_db(db_path: &Path, mode: LockMode) -> Result<LockGuard> {
    let path = lock_file_path(db_path);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    let res = match mode {
        LockMode::Shared => FileExt::try_lock_shared(&file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
    };
    if res.is_err() {
        return Err(KvError::usage(format!(
            "database {} is locked by another handle ({:?} lock unavailable)",
            db_path.display(),
            mode
        )));
    }
    Ok(LockGuard { file, path, mode })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_shared() {
        let mut p = std::env::temp_dir();
        p.push(format!("ql-lock-{}", std::process::id()));
        let g = try_lock_db(&p, LockMode::Exclusive).unwrap();
        assert_eq!(g.mode(), LockMode::Exclusive);
        assert!(try_lock_db(&p, LockMode::Shared).is_err());
        drop(g);
        let s1 = try_lock_db(&p, LockMode::Shared).unwrap();
        let s2 = try_lock_db(&p, LockMode::Shared).unwrap();
        assert!(try_lock_db(&p, LockMode::Exclusive).is_err());
        drop((s1, s2));
        let _ = std::fs::remove_file(lock_file_path(&p));
    }
}
