//! Общие константы формата (header page, pages, views, keys).

// -------- Платформа --------
pub const IS_64BIT: bool = cfg!(target_pointer_width = "64");
const PLATFORM_64: usize = IS_64BIT as usize;

// -------- Views / cache --------
/// Максимум одновременно отображённых view в windowed-режиме.
pub const DB_MAX_VIEWS: usize = 2048 << PLATFORM_64;
/// Сколько view выталкивать за раз, когда превышен DB_MAX_VIEWS.
pub const DB_NUM_DELETE_FROM_CACHE: usize = 16;
/// Ёмкость кэша живых Page (в страницах).
pub const DB_DEFAULT_PAGECACHE_SIZE: usize = 1024 << (PLATFORM_64 * 2);

// -------- Pages --------
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 4096;
/// Смещения внутри страницы хранятся в u16.
pub const MAX_PAGE_SIZE: usize = 32768;
pub const DEFAULT_VIEW_SIZE: usize = (DEFAULT_PAGE_SIZE * 64) << PLATFORM_64;

/// Страница 0 занята заголовком и служит EOF/null-маркером.
pub const DB_EOF_PGNO: u32 = 0;

// -------- Keys --------
pub const MIN_KEYS: usize = 4;
/// Предел длины ключа в ячейке (u8 длина).
pub const MAX_KEY_SIZE: usize = 255;
/// Предел длины ключа для пользовательских таблиц.
pub const MAX_TABLE_KEY_SIZE: usize = 254;
/// Ниже этого заполнения (в процентах) страница считается недогруженной.
pub const UNDERFLOW_FILL_PERCENT: usize = 25;

// -------- Header page --------
pub const HEADER_PAGE_SIZE: usize = 4096;
/// Две копии заголовка (ping-pong) внутри header page.
pub const HEADER_SLOT_SIZE: usize = HEADER_PAGE_SIZE / 2;
pub const DB_MAGIC: &[u8; 8] = b"QLDBHDR1";
pub const DB_FORMAT_VERSION: u32 = 1;
pub const MAX_APP_NAME: usize = 64;

// -------- Catalog --------
/// Имя служебной таблицы-каталога (name -> TableData).
pub const MAIN_TABLE_NAME: &str = "";
