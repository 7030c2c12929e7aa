//! Stable hashing for hash-table buckets.
//!
//! xxhash64 с seed=0 (не std::DefaultHasher): раскладка ключей по бакетам
//! не должна зависеть от toolchain/платформы, она записана в файле.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// 64-bit stable hash of a key.
#[inline]
pub fn hash64(key: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(key);
    h.finish()
}

#[inline]
pub fn bucket_index(hash: u64, buckets: usize) -> usize {
    debug_assert!(buckets > 0, "buckets must be > 0");
    (hash % buckets as u64) as usize
}

#[inline]
pub fn bucket_of_key(key: &[u8], buckets: usize) -> usize {
    bucket_index(hash64(key), buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_in_range() {
        assert_eq!(hash64(b"alpha"), hash64(b"alpha"));
        assert_ne!(hash64(b"alpha"), hash64(b"beta"));
        for i in 0..1000u32 {
            let b = bucket_of_key(&i.to_le_bytes(), 1020);
            assert!(b < 1020);
        }
    }
}
