//! Bounded least-recently-used map with an eviction hook.
//!
//! Entries live in a slab (`Vec<Option<Node>>`) threaded by a doubly linked
//! list, so touch, insert and evict are O(1). The eviction hook is supplied
//! per insertion, which lets the owner of the cache finalize evicted values
//! using its own state without the cache holding a reference to it.
//!
//! The cache is neither `Send` nor `Sync`: it holds open shard handles and is
//! meant to be driven by exactly one thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    _single_thread: PhantomData<Rc<()>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// A cache holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            _single_thread: PhantomData,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Mutable access that also marks the entry most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.slots[idx].as_mut().map(|n| &mut n.value)
    }

    /// Mutable access without touching recency.
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.map.get(key)?;
        self.slots[idx].as_mut().map(|n| &mut n.value)
    }

    /// Insert `key` as most recently used.
    ///
    /// When the key is new and the cache is full, the least recently used
    /// entry is removed first and handed to `on_evict`; if the hook fails the
    /// error is returned and `key` is not inserted. Inserting an existing key
    /// replaces its value without evicting anything.
    ///
    /// # Errors
    /// Propagates the hook's error.
    pub fn insert_with<E>(
        &mut self,
        key: K,
        value: V,
        on_evict: impl FnOnce(K, V) -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = self.slots[idx].as_mut() {
                node.value = value;
            }
            self.move_to_front(idx);
            return Ok(());
        }
        if self.map.len() >= self.capacity
            && let Some((old_key, old_value)) = self.pop_lru()
        {
            on_evict(old_key, old_value)?;
        }
        let idx = self.alloc(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.map.insert(key, idx);
        self.push_front(idx);
        Ok(())
    }

    /// Evict least recently used entries through `on_evict` until there is
    /// room for one more entry.
    ///
    /// # Errors
    /// Propagates the first hook error; the failed entry is already removed.
    pub fn make_room_with<E>(&mut self, mut on_evict: impl FnMut(K, V) -> Result<(), E>) -> Result<(), E> {
        while self.map.len() >= self.capacity {
            let Some((key, value)) = self.pop_lru() else {
                break;
            };
            on_evict(key, value)?;
        }
        Ok(())
    }

    /// Remove and return the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        self.map.remove(&node.key);
        Some((node.key, node.value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        Some(node.value)
    }

    /// Keys from most to least recently used.
    #[must_use]
    pub fn keys_mru(&self) -> Vec<K> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.head;
        while let Some(idx) = cur {
            let Some(node) = self.slots[idx].as_ref() else {
                break;
            };
            out.push(node.key.clone());
            cur = node.next;
        }
        out
    }

    /// Iterate over all values (order unspecified).
    pub fn values_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|n| (&n.key, &mut n.value)))
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].as_mut() {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.slots[nx].as_mut() {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.slots[idx].as_mut() {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(n) = self.slots[idx].as_mut() {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(n) = self.slots[h].as_mut()
        {
            n.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn put(c: &mut LruCache<&'static str, u32>, k: &'static str, v: u32, evicted: &mut Vec<&'static str>) {
        c.insert_with(k, v, |ek, _| {
            evicted.push(ek);
            Ok::<(), Infallible>(())
        })
        .unwrap();
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut c = LruCache::new(2);
        let mut ev = Vec::new();
        put(&mut c, "a", 1, &mut ev);
        put(&mut c, "b", 2, &mut ev);
        assert!(c.get_mut(&"a").is_some());
        put(&mut c, "c", 3, &mut ev);
        assert_eq!(ev, vec!["b"]);
        assert_eq!(c.keys_mru(), vec!["c", "a"]);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn reinsert_does_not_evict() {
        let mut c = LruCache::new(1);
        let mut ev = Vec::new();
        put(&mut c, "a", 1, &mut ev);
        put(&mut c, "a", 5, &mut ev);
        assert!(ev.is_empty());
        assert_eq!(c.peek_mut(&"a").copied(), Some(5));
    }

    #[test]
    fn hook_error_aborts_insert() {
        let mut c: LruCache<u32, u32> = LruCache::new(1);
        c.insert_with(1, 1, |_, _| Ok::<(), &str>(())).unwrap();
        let err = c.insert_with(2, 2, |_, _| Err("disk full"));
        assert_eq!(err, Err("disk full"));
        assert!(!c.contains(&1));
        assert!(!c.contains(&2));
        assert!(c.is_empty());
    }

    #[test]
    fn slots_are_reused() {
        let mut c: LruCache<u32, u32> = LruCache::new(3);
        for i in 0..100 {
            c.insert_with(i, i, |_, _| Ok::<(), Infallible>(())).unwrap();
        }
        assert_eq!(c.len(), 3);
        assert_eq!(c.keys_mru(), vec![99, 98, 97]);
        assert!(c.slots.len() <= 4);
        assert_eq!(c.remove(&98), Some(98));
        assert_eq!(c.pop_lru(), Some((97, 97)));
        assert_eq!(c.keys_mru(), vec![99]);
    }
}
