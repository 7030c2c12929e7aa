//! O(1) LRU (HashMap + двусвязный список по ключам).
//!
//! Design:
//! - HashMap<K, Entry> хранит значение и ссылки prev/next (по ключу).
//! - head = MRU, tail = LRU.
//! - get() двигает узел в head.
//! - put() обновляет существующий (в head) или вставляет новый head, вытесняя tail
//!   при переполнении; вытесненная пара возвращается вызывающему.
//!
//! Используется и для кэша живых Page (pgno -> Page), и для набора view в
//! windowed-режиме (index -> Arc<View>).
//! Capacity=0 выключает кэш (no-op).

use std::collections::HashMap;
use std::hash::Hash;

pub(crate) struct Lru<K, V> {
    cap: usize,
    map: HashMap<K, Entry<K, V>>,
    head: Option<K>, // Most-recently used
    tail: Option<K>, // Least-recently used
}

struct Entry<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

impl<K: Copy + Eq + Hash, V> Lru<K, V> {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            map: HashMap::with_capacity(cap.min(1 << 16).max(1)),
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    /// Найти и сделать MRU.
    pub(crate) fn get(&mut self, key: K) -> Option<&V> {
        if !self.map.contains_key(&key) {
            return None;
        }
        self.detach(key);
        self.attach_front(key);
        self.map.get(&key).map(|e| &e.value)
    }

    /// Вставить/обновить. Возвращает вытесненную (LRU) пару, если ёмкость превышена.
    pub(crate) fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.cap == 0 {
            return None;
        }
        if let Some(e) = self.map.get_mut(&key) {
            e.value = value;
            self.detach(key);
            self.attach_front(key);
            return None;
        }

        let evicted = if self.map.len() >= self.cap {
            self.pop_lru()
        } else {
            None
        };

        self.map.insert(
            key,
            Entry {
                value,
                prev: None,
                next: None,
            },
        );
        self.attach_front(key);
        evicted
    }

    /// Вытолкнуть LRU-элемент.
    pub(crate) fn pop_lru(&mut self) -> Option<(K, V)> {
        let victim = self.tail?;
        self.detach(victim);
        self.map.remove(&victim).map(|e| (victim, e.value))
    }

    pub(crate) fn remove(&mut self, key: K) -> Option<V> {
        if !self.map.contains_key(&key) {
            return None;
        }
        self.detach(key);
        self.map.remove(&key).map(|e| e.value)
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.head = None;
        self.tail = None;
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values().map(|e| &e.value)
    }

    // ---------------- internal helpers ----------------

    fn detach(&mut self, key: K) {
        let (prev, next) = match self.map.get(&key) {
            Some(e) => (e.prev, e.next),
            None => return,
        };

        if self.head == Some(key) {
            self.head = next;
        }
        if self.tail == Some(key) {
            self.tail = prev;
        }

        if let Some(p) = prev {
            if let Some(pe) = self.map.get_mut(&p) {
                pe.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(ne) = self.map.get_mut(&n) {
                ne.prev = prev;
            }
        }

        if let Some(e) = self.map.get_mut(&key) {
            e.prev = None;
            e.next = None;
        }
    }

    fn attach_front(&mut self, key: K) {
        if self.head == Some(key) {
            return;
        }

        if let Some(e) = self.map.get_mut(&key) {
            e.prev = None;
            e.next = self.head;
        }

        if let Some(old_head) = self.head {
            if let Some(he) = self.map.get_mut(&old_head) {
                he.prev = Some(key);
            }
        }

        self.head = Some(key);

        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru: Lru<u32, &str> = Lru::new(2);
        assert!(lru.put(1, "a").is_none());
        assert!(lru.put(2, "b").is_none());
        // 1 становится MRU
        assert_eq!(lru.get(1), Some(&"a"));
        let ev = lru.put(3, "c");
        assert_eq!(ev, Some((2, "b")));
        assert_eq!(lru.len(), 2);
        assert!(lru.get(2).is_none());
        assert_eq!(lru.get(3), Some(&"c"));
        assert_eq!(lru.get(1), Some(&"a"));
    }

    #[test]
    fn update_moves_to_front() {
        let mut lru: Lru<u32, u32> = Lru::new(3);
        lru.put(1, 10);
        lru.put(2, 20);
        lru.put(3, 30);
        lru.put(1, 11);
        assert_eq!(lru.pop_lru(), Some((2, 20)));
        assert_eq!(lru.pop_lru(), Some((3, 30)));
        assert_eq!(lru.pop_lru(), Some((1, 11)));
        assert_eq!(lru.pop_lru(), None);
    }

    #[test]
    fn zero_capacity_is_noop() {
        let mut lru: Lru<u32, u32> = Lru::new(0);
        assert!(lru.put(1, 1).is_none());
        assert_eq!(lru.len(), 0);
        assert!(lru.get(1).is_none());
    }

    #[test]
    fn remove_keeps_links_consistent() {
        let mut lru: Lru<u32, u32> = Lru::new(4);
        for i in 0..4 {
            lru.put(i, i);
        }
        assert_eq!(lru.remove(2), Some(2));
        assert_eq!(lru.remove(2), None);
        assert_eq!(lru.pop_lru(), Some((0, 0)));
        assert_eq!(lru.pop_lru(), Some((1, 1)));
        assert_eq!(lru.pop_lru(), Some((3, 3)));
    }
}
