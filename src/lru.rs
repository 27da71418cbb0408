/*
Fixed-capacity LRU replacement used as the page-cache substrate.

The recency order is a doubly linked list threaded through a flat slot
array by index (no pointer graph): head is the most recently used slot,
tail the least. Refreshing a slot and evicting the tail are both O(1),
and the slot storage itself never reallocates.

Two flavors:
 - FlatLru: plain LRU. Push always admits, evicting the tail.
 - LruK: admission is gated on a secondary counter cache; a key only
   enters the primary cache on its K-th touch. The counter cache has the
   same capacity as the primary, so rare keys can be forgotten before
   they ever mature.
*/

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node {
    prev: usize,
    next: usize,
}

// Recency list over slots 0..capacity. Always a permutation of the slot
// indices: every slot is on the list exactly once, bound or not.
pub struct LruQueue {
    nodes: Vec<Node>,
    head: usize,
    tail: usize,
}

impl LruQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 3, "lru capacity must be at least 3");
        let mut queue = LruQueue {
            nodes: (0..capacity).map(|_| Node { prev: NIL, next: NIL }).collect(),
            head: 0,
            tail: capacity - 1,
        };
        queue.reset();
        queue
    }

    pub fn reset(&mut self) {
        let num = self.nodes.len();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.prev = if i == 0 { NIL } else { i - 1 };
            node.next = if i + 1 == num { NIL } else { i + 1 };
        }
        self.head = 0;
        self.tail = num - 1;
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    // Move a slot to the head of the recency list. Returns the slot index.
    pub fn refresh(&mut self, index: usize) -> usize {
        if index == self.head {
            return index;
        }

        if index == self.tail {
            self.tail = self.nodes[index].prev;
            self.nodes[self.tail].next = NIL;
        } else {
            let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
        }

        self.nodes[index].prev = NIL;
        self.nodes[index].next = self.head;
        self.nodes[self.head].prev = index;
        self.head = index;
        index
    }
}

pub struct FlatLru<K, V> {
    queue: LruQueue,
    keys: Vec<Option<K>>,
    values: Vec<V>,
    map: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, V: Default> FlatLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        FlatLru {
            queue: LruQueue::new(capacity),
            keys: (0..capacity).map(|_| None).collect(),
            values: (0..capacity).map(|_| V::default()).collect(),
            map: HashMap::with_capacity(capacity),
        }
    }

    // Lookup without touching the recency order.
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        let index = *self.map.get(key)?;
        Some(&mut self.values[index])
    }

    // Lookup that refreshes the slot to most-recently-used.
    pub fn refer(&mut self, key: &K) -> Option<usize> {
        let index = *self.map.get(key)?;
        Some(self.queue.refresh(index))
    }

    pub fn get_and_refer(&mut self, key: &K) -> Option<&mut V> {
        let index = self.refer(key)?;
        Some(&mut self.values[index])
    }

    // Bind `key` to a slot, evicting the least recently used binding when
    // the key is new. The returned slot still holds the evicted value;
    // the caller must overwrite it before reading.
    pub fn push(&mut self, key: K) -> &mut V {
        if let Some(index) = self.refer(&key) {
            return &mut self.values[index];
        }

        let index = self.queue.refresh(self.queue.tail());
        if let Some(old) = self.keys[index].take() {
            self.map.remove(&old);
        }
        self.map.insert(key.clone(), index);
        self.keys[index] = Some(key);
        &mut self.values[index]
    }

    pub fn insert(&mut self, key: K, value: V) {
        *self.push(key) = value;
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn reset(&mut self) {
        self.map.clear();
        self.queue.reset();
        for slot in self.keys.iter_mut() {
            *slot = None;
        }
        for value in self.values.iter_mut() {
            *value = V::default();
        }
    }

    #[cfg(test)]
    fn queue(&self) -> &LruQueue {
        &self.queue
    }
}

// LRU-K: a key must be touched K times before it is admitted into the
// primary cache. Touch counts live in a secondary FlatLru of the same
// capacity, so they are themselves subject to eviction.
pub struct LruK<K, V> {
    history: FlatLru<K, u32>,
    primary: FlatLru<K, V>,
    k: u32,
}

impl<K: Eq + Hash + Clone, V: Default> LruK<K, V> {
    pub fn new(capacity: usize, k: u32) -> Self {
        assert!(k >= 1);
        LruK {
            history: FlatLru::new(capacity),
            primary: FlatLru::new(capacity),
            k,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        self.primary.get_and_refer(key)
    }

    // Gated admission: unknown keys start a counter at 1 and are rejected;
    // keys below K-1 touches bump the counter and are rejected; the K-th
    // touch resets the counter and admits the key.
    pub fn push(&mut self, key: K) -> Option<&mut V> {
        if self.primary.contains(&key) {
            return self.primary.get_and_refer(&key);
        }

        if !self.history.contains(&key) {
            *self.history.push(key) = 1;
            return None;
        }
        if let Some(count) = self.history.get(&key) {
            if *count < self.k - 1 {
                *count += 1;
                return None;
            }
            *count = 1;
        }
        Some(self.primary.push(key))
    }

    pub fn insert(&mut self, key: K, value: V) -> bool {
        match self.push(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.primary.contains(key)
    }

    pub fn reset(&mut self) {
        self.history.reset();
        self.primary.reset();
    }
}
