//! Windowed segment-name -> byte-size cache, fed by the optional origin
//! directory-listing scraper and read by the event parser's segment-byte
//! accounting.
//!
//! Capped at `capacity` most-recently-inserted segments; insertion evicts
//! the oldest entry once the cap is exceeded. Reads never block a writer
//! and vice versa (`parking_lot::RwLock` guards a small ordered map; lookups
//! are O(1) and the map itself is never allowed to grow unbounded).

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;

pub struct SegmentSizeCache {
    sizes: DashMap<String, u64>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl SegmentSizeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            sizes: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Insert or refresh an entry, evicting the oldest if over capacity.
    pub fn insert(&self, name: impl Into<String>, size: u64) {
        let name = name.into();
        let is_new = self.sizes.insert(name.clone(), size).is_none();
        if !is_new {
            return;
        }
        let mut order = self.order.lock();
        order.push_back(name);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.sizes.remove(&oldest);
            }
        }
    }

    /// Replace the whole cache contents from a fresh scrape, preserving the
    /// capacity/eviction invariant.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, u64)>) {
        self.sizes.clear();
        self.order.lock().clear();
        for (name, size) in entries {
            self.insert(name, size);
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.sizes.get(name).map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}
