//! page/common — общие константы/offset’ы страниц (branch, leaf, big-data, hash directory).
//!
//! Заголовок страницы (16 B, LE):
//!   [0]      u8  flags   (P_BRANCH | P_LEAF | P_BIGDATA | P_HASHDIR)
//!   [1]      u8  reserved
//!   [2..4)   u16 num     (число записей / бакетов)
//!   [4..6)   u16 lower   (конец массива слотов; для big-data — длина payload)
//!   [6..8)   u16 upper   (начало области ячеек, ячейки растут от конца страницы вниз)
//!   [8..12)  u32 link    (следующая страница цепочки: big-data / hash-бакет)
//!   [12..16) u32 frag    (байт «дыр» после удалений, собираются compaction’ом)

/// Размер заголовка любой страницы.
pub const PAGE_HDR_SIZE: usize = 16;

pub const OFF_FLAGS: usize = 0;
pub const OFF_NUM: usize = 2;
pub const OFF_LOWER: usize = 4;
pub const OFF_UPPER: usize = 6;
pub const OFF_LINK: usize = 8;
pub const OFF_FRAG: usize = 12;

// ---------- Типы страниц ----------
pub const P_BRANCH: u8 = 0x01;
pub const P_LEAF: u8 = 0x02;
pub const P_BIGDATA: u8 = 0x04;
pub const P_HASHDIR: u8 = 0x08;

/// Слот массива смещений (u16).
pub const SLOT_SIZE: usize = 2;

// ---------- Ячейки ----------
/// dflags: значение вынесено в big-data цепочку.
pub const F_BIGDATA: u8 = 0x01;

/// Заголовок leaf-ячейки без klen: [dflags u8][dsize u32].
pub const LEAF_CELL_HDR: usize = 5;
/// Заголовок branch-ячейки без klen: [child u32].
pub const BRANCH_CELL_HDR: usize = 4;
/// Ссылка на big-data внутри leaf-ячейки: [full u64][tail pgno u32].
pub const BIGDATA_REF_SIZE: usize = 12;

// ---------- Hash directory ----------
/// Размер записи бакета в директории (u32 pgno головы цепочки).
pub const HASH_BUCKET_SIZE: usize = 4;
