#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod config;
pub mod error;
pub mod metrics;
pub mod meta;
pub mod util;
pub mod lock;
pub mod hash;

// Страницы, файл, транзакции
pub mod page;    // src/page/{mod,common,layout,entry}.rs
pub mod storage; // src/storage/{mod,core,open,rebuild,checkpoint,vacuum,view,cache,free}.rs
pub mod txn;     // src/txn/{mod,alloc}.rs

// Таблицы и курсоры
pub mod map;     // src/map/{mod,table}.rs
pub mod cursor;  // src/cursor/{mod,btree,hash,bigdata}.rs

// Удобные реэкспорты
pub use config::{LiteConfig, StorageBuilder, ViewMode};
pub use cursor::{Cursor, CursorPos};
pub use error::KvError;
pub use map::{DbTable, TableData, TableKind};
pub use meta::{pack_version, unpack_version, DbHeader};
pub use storage::core::ProgressHandler;
pub use storage::{KvStorage, StorageStats, VacuumSummary};
pub use txn::{Transaction, TxnStatus};
