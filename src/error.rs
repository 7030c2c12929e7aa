//! Таксономия ошибок хранилища.
//!
//! Все публичные функции возвращают `anyhow::Result`; типизированная причина
//! лежит внутри `anyhow::Error` и достаётся через `KvError::kind_of(&err)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    // ---- format / corruption ----
    #[error("bad database format: {0}")]
    BadFormat(String),
    #[error("database corrupted: {0}")]
    Corrupt(String),

    // ---- resources ----
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mapping failed: {0}")]
    Mapping(String),

    // ---- usage ----
    #[error("invalid usage: {0}")]
    Usage(String),
    #[error("database is read-only")]
    ReadOnly,
    #[error("operation not implemented for this table kind: {0}")]
    NotImplemented(&'static str),
    #[error("database already exists at {0}")]
    AlreadyExists(String),
    #[error("operation interrupted by progress handler")]
    Interrupted,

    // ---- constraints ----
    #[error("key too large: {len} > {max}")]
    KeyTooLarge { len: usize, max: usize },
    #[error("key size mismatch: table expects {expected} bytes, got {got}")]
    KeySizeMismatch { expected: usize, got: usize },
}

impl KvError {
    /// Достать типизированную причину из anyhow-цепочки (если она там есть).
    pub fn kind_of(err: &anyhow::Error) -> Option<&KvError> {
        err.chain().find_map(|e| e.downcast_ref::<KvError>())
    }

    /// Ошибка проверки аргументов/состояния: возникает до любой записи страниц.
    pub fn is_precondition(err: &anyhow::Error) -> bool {
        matches!(
            Self::kind_of(err),
            Some(
                KvError::Usage(_)
                    | KvError::ReadOnly
                    | KvError::NotImplemented(_)
                    | KvError::AlreadyExists(_)
                    | KvError::KeyTooLarge { .. }
                    | KvError::KeySizeMismatch { .. }
            )
        )
    }

    pub fn usage<S: Into<String>>(msg: S) -> anyhow::Error {
        anyhow::Error::new(KvError::Usage(msg.into()))
    }

    pub fn corrupt<S: Into<String>>(msg: S) -> anyhow::Error {
        anyhow::Error::new(KvError::Corrupt(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context() {
        let r: anyhow::Result<()> = Err(anyhow::Error::new(KvError::ReadOnly));
        let err = r.context("put").unwrap_err();
        assert!(matches!(KvError::kind_of(&err), Some(KvError::ReadOnly)));
    }

    #[test]
    fn precondition_kinds() {
        assert!(KvError::is_precondition(&KvError::usage("x")));
        assert!(KvError::is_precondition(&anyhow::Error::new(KvError::KeyTooLarge { len: 9, max: 8 })));
        assert!(!KvError::is_precondition(&anyhow::Error::new(KvError::Mapping("grow".into()))));
        assert!(!KvError::is_precondition(&KvError::corrupt("bad page")));
        assert!(!KvError::is_precondition(&anyhow::anyhow!("plain")));
    }

    #[test]
    fn plain_anyhow_has_no_kind() {
        let err = anyhow::anyhow!("plain");
        assert!(KvError::kind_of(&err).is_none());
    }
}
