//! Arena-backed LRU map
//!
//! Entries live in a dense `Vec` of slots linked by `prev`/`next` indices;
//! freed slots are recycled through a free list. Every operation except
//! `drain` is O(1).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

const NIL: usize = usize::MAX;

/// A cached entry
#[derive(Debug)]
pub struct Node<K, V> {
    pub key: K,
    pub value: V,
    pub cost: usize,
    /// Last insert or hit
    pub time: Instant,
}

struct Slot<K, V> {
    node: Option<Node<K, V>>,
    prev: usize,
    next: usize,
}

/// Recency-ordered map; the head is most recently used
pub struct LruMap<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    total_cost: usize,
}

impl<K: Hash + Eq + Clone, V> LruMap<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            total_cost: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Exact sum of live entry costs
    pub fn total_cost(&self) -> usize {
        self.total_cost
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_head(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Look up `key`, mark it most recently used and stamp `now`
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&mut Node<K, V>> {
        let idx = *self.map.get(key)?;
        if self.head != idx {
            self.unlink(idx);
            self.push_head(idx);
        }
        let node = self.slots[idx].node.as_mut()?;
        node.time = now;
        Some(node)
    }

    /// Look up `key` without touching recency
    pub fn peek(&self, key: &K) -> Option<&Node<K, V>> {
        let idx = *self.map.get(key)?;
        self.slots[idx].node.as_ref()
    }

    /// Insert or replace; returns the replaced value
    pub fn insert(&mut self, key: K, value: V, cost: usize, now: Instant) -> Option<V> {
        if let Some(&idx) = self.map.get(&key) {
            let node = self.slots[idx].node.as_mut()?;
            self.total_cost = self.total_cost - node.cost + cost;
            node.cost = cost;
            node.time = now;
            let old = std::mem::replace(&mut node.value, value);
            if self.head != idx {
                self.unlink(idx);
                self.push_head(idx);
            }
            return Some(old);
        }

        let node = Node {
            key: key.clone(),
            value,
            cost,
            time: now,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].node = Some(node);
                idx
            }
            None => {
                self.slots.push(Slot {
                    node: Some(node),
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.push_head(idx);
        self.map.insert(key, idx);
        self.total_cost += cost;
        None
    }

    fn take(&mut self, idx: usize) -> Option<Node<K, V>> {
        self.unlink(idx);
        let node = self.slots[idx].node.take()?;
        self.map.remove(&node.key);
        self.free.push(idx);
        self.total_cost -= node.cost;
        Some(node)
    }

    pub fn remove(&mut self, key: &K) -> Option<Node<K, V>> {
        let idx = *self.map.get(key)?;
        self.take(idx)
    }

    /// Least recently used entry
    pub fn peek_tail(&self) -> Option<&Node<K, V>> {
        if self.tail == NIL {
            return None;
        }
        self.slots[self.tail].node.as_ref()
    }

    pub fn pop_tail(&mut self) -> Option<Node<K, V>> {
        if self.tail == NIL {
            return None;
        }
        self.take(self.tail)
    }

    /// Remove everything, returning the values so the caller decides where they drop
    pub fn drain(&mut self) -> Vec<V> {
        let values = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.node.map(|node| node.value))
            .collect();
        self.map.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.total_cost = 0;
        values
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut idx = self.head;
        while idx != NIL {
            if let Some(node) = &self.slots[idx].node {
                keys.push(node.key.clone());
            }
            idx = self.slots[idx].next;
        }
        keys
    }
}

impl<K: Hash + Eq + Clone, V> Default for LruMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(keys: &[&'static str]) -> LruMap<&'static str, u32> {
        let mut lru = LruMap::new();
        for (i, key) in keys.iter().enumerate() {
            lru.insert(*key, i as u32, 1, Instant::now());
        }
        lru
    }

    #[test]
    fn test_insert_orders_mru_first() {
        let lru = map_with(&["a", "b", "c"]);
        assert_eq!(lru.keys(), vec!["c", "b", "a"]);
        assert_eq!(lru.peek_tail().unwrap().key, "a");
    }

    #[test]
    fn test_get_promotes() {
        let mut lru = map_with(&["a", "b", "c"]);
        assert_eq!(lru.get(&"a", Instant::now()).unwrap().value, 0);
        assert_eq!(lru.keys(), vec!["a", "c", "b"]);
        assert_eq!(lru.pop_tail().unwrap().key, "b");
    }

    #[test]
    fn test_replace_updates_cost() {
        let mut lru = LruMap::new();
        lru.insert("a", 1, 10, Instant::now());
        lru.insert("b", 2, 5, Instant::now());
        assert_eq!(lru.total_cost(), 15);

        let old = lru.insert("a", 3, 1, Instant::now());
        assert_eq!(old, Some(1));
        assert_eq!(lru.total_cost(), 6);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_recycles_slots() {
        let mut lru = map_with(&["a", "b", "c"]);
        assert_eq!(lru.remove(&"b").unwrap().value, 1);
        assert!(lru.remove(&"b").is_none());
        assert_eq!(lru.keys(), vec!["c", "a"]);

        lru.insert("d", 9, 1, Instant::now());
        assert_eq!(lru.slots.len(), 3);
        assert_eq!(lru.keys(), vec!["d", "c", "a"]);
        assert_eq!(lru.total_cost(), 3);
    }

    #[test]
    fn test_pop_until_empty() {
        let mut lru = map_with(&["a", "b"]);
        assert_eq!(lru.pop_tail().unwrap().key, "a");
        assert_eq!(lru.pop_tail().unwrap().key, "b");
        assert!(lru.pop_tail().is_none());
        assert!(lru.is_empty());
        assert_eq!(lru.total_cost(), 0);
    }

    #[test]
    fn test_drain() {
        let mut lru = map_with(&["a", "b", "c"]);
        lru.remove(&"a");
        let mut values = lru.drain();
        values.sort();
        assert_eq!(values, vec![1, 2]);
        assert!(lru.is_empty());
        assert!(lru.peek(&"b").is_none());
    }
}
