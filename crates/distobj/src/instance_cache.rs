//! Bounded LRU cache of serialized instance data.
//!
//! Entries are keyed by object identifier and hold a contiguous window of
//! versions. The byte total stays under the configured bound except while
//! entries are pinned; eviction never frees a pinned entry.

use crate::error::fatal;
use bytes::Bytes;
use distnet::{InstanceId, NodeId, ObjectId, Version};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// One cached full serialization of an object.
#[derive(Debug, Clone)]
pub struct CachedInstance {
    pub version: Version,
    pub data: Bytes,
}

struct Entry {
    master_instance_id: InstanceId,
    /// The node that produced the data; its departure drops the entry.
    origin: NodeId,
    /// Byte order the producer serialized in.
    big_endian: bool,
    versions: VecDeque<CachedInstance>,
    ref_count: u32,
    atime: Instant,
    bytes: u64,
}

/// Pinned snapshot of a cache entry, handed to the map protocol.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub master_instance_id: InstanceId,
    pub big_endian: bool,
    pub versions: Vec<CachedInstance>,
}

struct Inner {
    map: HashMap<ObjectId, Entry>,
    total: u64,
}

pub struct InstanceCache {
    inner: Mutex<Inner>,
    capacity: u64,
    robust: bool,
}

impl InstanceCache {
    /// `capacity` in bytes; zero disables the cache entirely.
    pub fn new(capacity: u64, robust: bool) -> Self {
        InstanceCache {
            inner: Mutex::new(Inner { map: HashMap::new(), total: 0 }),
            capacity,
            robust,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Record instance data for `(id, version)`. Duplicate versions only
    /// refresh the access time; a duplicate with different bytes is a
    /// protocol bug. Non-contiguous versions restart the entry's window.
    pub fn add(
        &self,
        id: ObjectId,
        master_instance_id: InstanceId,
        origin: NodeId,
        big_endian: bool,
        version: Version,
        data: Bytes,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        let entry = inner.map.entry(id).or_insert_with(|| Entry {
            master_instance_id,
            origin,
            big_endian,
            versions: VecDeque::new(),
            ref_count: 0,
            atime: now,
            bytes: 0,
        });
        entry.atime = now;

        if let Some(existing) = entry.versions.iter().find(|c| c.version == version) {
            if existing.data != data {
                fatal!(self.robust, "diverging instance data for {id} v{version}");
            }
            return false;
        }

        match entry.versions.back() {
            Some(back) if back.version.next() != version => {
                // A gap: the window restarts at the new version.
                trace!("cache window restart for {id} at v{version}");
                inner.total -= entry.bytes;
                entry.bytes = 0;
                entry.versions.clear();
            }
            _ => {}
        }

        let len = data.len() as u64;
        entry.versions.push_back(CachedInstance { version, data });
        entry.bytes += len;
        entry.master_instance_id = master_instance_id;
        entry.origin = origin;
        entry.big_endian = big_endian;
        inner.total += len;

        self.evict(inner, Some(id));
        true
    }

    /// Look up and pin the entry for `id`. The caller owes one
    /// [`InstanceCache::release`] per successful lookup.
    pub fn lookup(&self, id: ObjectId) -> Option<CacheHit> {
        let mut inner = self.inner.lock();
        let entry = inner.map.get_mut(&id)?;
        if entry.versions.is_empty() {
            return None;
        }
        entry.ref_count += 1;
        entry.atime = Instant::now();
        Some(CacheHit {
            master_instance_id: entry.master_instance_id,
            big_endian: entry.big_endian,
            versions: entry.versions.iter().cloned().collect(),
        })
    }

    /// Release `count` pins on `id`. Returns false if the entry is gone or
    /// was not pinned that often.
    pub fn release(&self, id: ObjectId, count: u32) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.map.get_mut(&id) else {
            return false;
        };
        if entry.ref_count < count {
            warn!("releasing {count} pins on {id} with only {} held", entry.ref_count);
            entry.ref_count = 0;
        } else {
            entry.ref_count -= count;
        }
        self.evict(inner, None);
        true
    }

    /// Drop the entry for `id` regardless of age (but not while pinned).
    pub fn erase(&self, id: ObjectId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.get(&id) {
            if entry.ref_count > 0 {
                warn!("not erasing pinned cache entry for {id}");
                return;
            }
        }
        if let Some(entry) = inner.map.remove(&id) {
            inner.total -= entry.bytes;
        }
    }

    /// Drop unpinned entries not touched within `age`.
    pub fn expire(&self, age: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<ObjectId> = inner
            .map
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && now.duration_since(e.atime) >= age)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(entry) = inner.map.remove(&id) {
                inner.total -= entry.bytes;
            }
        }
    }

    /// Drop every entry contributed by the given node.
    pub fn remove_node(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        let from_node: Vec<ObjectId> = inner
            .map
            .iter()
            .filter(|(_, e)| e.origin == node)
            .map(|(id, _)| *id)
            .collect();
        for id in from_node {
            if let Some(entry) = inner.map.remove(&id) {
                inner.total -= entry.bytes;
            }
        }
    }

    /// Current byte total, pinned entries included.
    pub fn size(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Evict least-recently-used unpinned entries until the total fits.
    /// `keep` protects the entry just touched from evicting itself.
    fn evict(&self, inner: &mut Inner, keep: Option<ObjectId>) {
        while inner.total > self.capacity {
            let victim = inner
                .map
                .iter()
                .filter(|(id, e)| e.ref_count == 0 && Some(**id) != keep)
                .min_by_key(|(_, e)| e.atime)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    let entry = inner.map.remove(&id).expect("victim exists");
                    trace!("evicting {id} ({} bytes)", entry.bytes);
                    inner.total -= entry.bytes;
                }
                // Everything left is pinned; the bound is transiently
                // exceeded until pins are released.
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: u64) -> InstanceCache {
        InstanceCache::new(capacity, false)
    }

    fn blob(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_add_and_lookup() {
        let cache = cache(1024);
        let id = ObjectId::generate();
        let origin = NodeId::generate();
        assert!(cache.add(id, 1, origin, false, Version::FIRST, blob(10, 1)));
        assert!(cache.add(id, 1, origin, false, Version::new(0, 2), blob(10, 2)));

        let hit = cache.lookup(id).unwrap();
        assert_eq!(hit.master_instance_id, 1);
        assert_eq!(hit.versions.len(), 2);
        assert_eq!(hit.versions[0].version, Version::FIRST);
        assert_eq!(hit.versions[1].version, Version::new(0, 2));
        assert!(cache.release(id, 1));
    }

    #[test]
    fn test_duplicate_version_is_dropped() {
        let cache = cache(1024);
        let id = ObjectId::generate();
        let origin = NodeId::generate();
        assert!(cache.add(id, 1, origin, false, Version::FIRST, blob(10, 1)));
        assert!(!cache.add(id, 1, origin, false, Version::FIRST, blob(10, 1)));
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn test_gap_restarts_window() {
        let cache = cache(1024);
        let id = ObjectId::generate();
        let origin = NodeId::generate();
        cache.add(id, 1, origin, false, Version::FIRST, blob(10, 1));
        // Version 3 skips 2: the window restarts there.
        cache.add(id, 1, origin, false, Version::new(0, 3), blob(10, 3));

        let hit = cache.lookup(id).unwrap();
        assert_eq!(hit.versions.len(), 1);
        assert_eq!(hit.versions[0].version, Version::new(0, 3));
        cache.release(id, 1);
    }

    #[test]
    fn test_lru_eviction_respects_pins() {
        let cache = cache(100);
        let origin = NodeId::generate();
        let pinned = ObjectId::generate();
        cache.add(pinned, 1, origin, false, Version::FIRST, blob(60, 1));
        let _hit = cache.lookup(pinned).unwrap();

        let other = ObjectId::generate();
        cache.add(other, 1, origin, false, Version::FIRST, blob(60, 2));

        // Over capacity: the unpinned entry goes, the pinned one stays.
        assert!(cache.lookup(pinned).is_some());
        cache.release(pinned, 1);

        // With both over capacity and only `other` evictable, the total may
        // transiently exceed the bound; once pins drop, a further add
        // brings it back under.
        cache.release(pinned, 1);
        let third = ObjectId::generate();
        cache.add(third, 1, origin, false, Version::FIRST, blob(60, 3));
        assert!(cache.size() <= 100);
    }

    #[test]
    fn test_remove_node() {
        let cache = cache(1024);
        let origin_a = NodeId::generate();
        let origin_b = NodeId::generate();
        let from_a = ObjectId::generate();
        let from_b = ObjectId::generate();
        cache.add(from_a, 1, origin_a, false, Version::FIRST, blob(10, 1));
        cache.add(from_b, 1, origin_b, false, Version::FIRST, blob(10, 2));

        cache.remove_node(origin_a);
        assert!(cache.lookup(from_a).is_none());
        assert!(cache.lookup(from_b).is_some());
        cache.release(from_b, 1);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = cache(0);
        let id = ObjectId::generate();
        assert!(!cache.add(id, 1, NodeId::generate(), false, Version::FIRST, blob(10, 1)));
        assert!(cache.lookup(id).is_none());
    }

    #[test]
    fn test_expire() {
        let cache = cache(1024);
        let id = ObjectId::generate();
        cache.add(id, 1, NodeId::generate(), false, Version::FIRST, blob(10, 1));
        cache.expire(Duration::ZERO);
        assert!(cache.is_empty());
    }
}
