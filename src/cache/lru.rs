//! Sharded LRU cache with reference-counted entries.
//!
//! Every entry carries a reference count: one reference belongs to the
//! cache while the entry is resident, and one to each outstanding client
//! handle. An entry sits on exactly one of two lists while resident:
//!
//! - `in_use`: refs >= 2, currently pinned by at least one client, in no
//!   particular order;
//! - `lru`: refs == 1 (only the cache's own reference), ordered by recency
//!   with the newest entry at the tail.
//!
//! Only `lru` entries are eligible for eviction. An entry erased or evicted
//! while clients still hold it leaves both lists and is destroyed when the
//! last handle drops; its deleter runs exactly once.
//!
//! The cache is split into 16 shards selected by the top four bits of the
//! key hash, each with its own mutex. Deleters run with the owning shard's
//! mutex held and must not call back into the cache.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::hash::hash;

/// Destructor invoked with the key and value when an entry dies.
pub type Deleter<T> = Box<dyn FnOnce(&[u8], T) + Send>;

struct LruEntry<T> {
    value: Option<T>,
    deleter: Option<Deleter<T>>,
    next_hash: *mut LruEntry<T>,
    next: *mut LruEntry<T>,
    prev: *mut LruEntry<T>,
    charge: usize,
    key: Box<[u8]>,
    hash: u32,
    /// Whether the cache itself holds a reference.
    in_cache: bool,
    /// References, including the cache's own while `in_cache`.
    refs: u32,
}

impl<T> LruEntry<T> {
    fn list_head() -> *mut Self {
        let head = Box::into_raw(Box::new(Self {
            value: None,
            deleter: None,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge: 0,
            key: Box::from(&[][..]),
            hash: 0,
            in_cache: false,
            refs: 0,
        }));
        unsafe {
            (*head).next = head;
            (*head).prev = head;
        }
        head
    }
}

/// Chained hash table of resident entries, doubling when the load factor
/// passes one so bucket chains stay short.
struct HandleTable<T> {
    list: Vec<*mut LruEntry<T>>,
    elems: usize,
}

impl<T> HandleTable<T> {
    fn new() -> Self {
        Self {
            list: vec![ptr::null_mut(); 4],
            elems: 0,
        }
    }

    /// Pointer to the slot holding the matching entry, or to the empty
    /// tail slot of its bucket chain.
    fn find_pointer(&mut self, key: &[u8], h: u32) -> *mut *mut LruEntry<T> {
        let mask = self.list.len() - 1;
        unsafe {
            let mut ptr: *mut *mut LruEntry<T> =
                self.list.as_mut_ptr().add(h as usize & mask);
            while !(*ptr).is_null() && ((**ptr).hash != h || (**ptr).key.as_ref() != key) {
                ptr = ptr::addr_of_mut!((**ptr).next_hash);
            }
            ptr
        }
    }

    fn lookup(&mut self, key: &[u8], h: u32) -> *mut LruEntry<T> {
        unsafe { *self.find_pointer(key, h) }
    }

    /// Insert `entry`, returning a previous entry with the same key.
    fn insert(&mut self, entry: *mut LruEntry<T>) -> *mut LruEntry<T> {
        unsafe {
            let key = std::slice::from_raw_parts((*entry).key.as_ptr(), (&(*entry).key).len());
            let ptr = self.find_pointer(key, (*entry).hash);
            let old = *ptr;
            (*entry).next_hash = if old.is_null() {
                ptr::null_mut()
            } else {
                (*old).next_hash
            };
            *ptr = entry;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.list.len() {
                    self.resize();
                }
            }
            old
        }
    }

    fn remove(&mut self, key: &[u8], h: u32) -> *mut LruEntry<T> {
        unsafe {
            let ptr = self.find_pointer(key, h);
            let result = *ptr;
            if !result.is_null() {
                *ptr = (*result).next_hash;
                self.elems -= 1;
            }
            result
        }
    }

    fn resize(&mut self) {
        let mut new_length = 4;
        while new_length < self.elems {
            new_length *= 2;
        }
        let mut new_list: Vec<*mut LruEntry<T>> = vec![ptr::null_mut(); new_length];
        for &head in &self.list {
            let mut e = head;
            while !e.is_null() {
                unsafe {
                    let next = (*e).next_hash;
                    let slot = &mut new_list[(*e).hash as usize & (new_length - 1)];
                    (*e).next_hash = *slot;
                    *slot = e;
                    e = next;
                }
            }
        }
        self.list = new_list;
    }
}

/// Mutex-guarded state of a single cache shard.
struct LruState<T> {
    capacity: usize,
    usage: usize,
    /// Dummy head of the eviction-ordered list (next = oldest).
    lru: *mut LruEntry<T>,
    /// Dummy head of the pinned list.
    in_use: *mut LruEntry<T>,
    table: HandleTable<T>,
}

unsafe fn list_remove<T>(e: *mut LruEntry<T>) {
    (*(*e).next).prev = (*e).prev;
    (*(*e).prev).next = (*e).next;
}

unsafe fn list_append<T>(list: *mut LruEntry<T>, e: *mut LruEntry<T>) {
    // Newest entry goes just before the dummy head.
    (*e).next = list;
    (*e).prev = (*list).prev;
    (*(*e).prev).next = e;
    (*(*e).next).prev = e;
}

impl<T> LruState<T> {
    fn ref_entry(&mut self, e: *mut LruEntry<T>) {
        unsafe {
            if (*e).refs == 1 && (*e).in_cache {
                // Gaining its first client reference; pin it.
                list_remove(e);
                list_append(self.in_use, e);
            }
            (*e).refs += 1;
        }
    }

    fn unref(&mut self, e: *mut LruEntry<T>) {
        unsafe {
            debug_assert!((*e).refs > 0);
            (*e).refs -= 1;
            if (*e).refs == 0 {
                debug_assert!(!(*e).in_cache);
                let value = (*e).value.take().expect("dead entry revived");
                if let Some(deleter) = (*e).deleter.take() {
                    deleter(&(*e).key, value);
                }
                drop(Box::from_raw(e));
            } else if (*e).in_cache && (*e).refs == 1 {
                // Lost its last client reference; make it evictable.
                list_remove(e);
                list_append(self.lru, e);
            }
        }
    }

    /// Finish removing `e` from the cache; it has already left the hash
    /// table. Returns whether there was anything to do.
    fn finish_erase(&mut self, e: *mut LruEntry<T>) -> bool {
        if e.is_null() {
            return false;
        }
        unsafe {
            debug_assert!((*e).in_cache);
            list_remove(e);
            (*e).in_cache = false;
            self.usage -= (*e).charge;
        }
        self.unref(e);
        true
    }
}

struct LruCacheInner<T> {
    state: Mutex<LruState<T>>,
}

unsafe impl<T: Send + Sync> Send for LruCacheInner<T> {}
unsafe impl<T: Send + Sync> Sync for LruCacheInner<T> {}

impl<T> Drop for LruCacheInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        unsafe {
            // All handles hold the inner alive, so nothing can be pinned.
            debug_assert!((*state.in_use).next == state.in_use);

            let mut e = (*state.lru).next;
            while e != state.lru {
                let next = (*e).next;
                debug_assert!((*e).in_cache);
                debug_assert_eq!((*e).refs, 1);
                (*e).in_cache = false;
                state.unref(e);
                e = next;
            }

            drop(Box::from_raw(state.lru));
            drop(Box::from_raw(state.in_use));
        }
    }
}

/// A reference to a resident cache entry.
///
/// The handle pins its entry: the value stays alive at least until the
/// handle is dropped (or passed to [`LruCache::release`]).
pub struct CacheHandle<T: Send + Sync> {
    inner: Arc<LruCacheInner<T>>,
    entry: NonNull<LruEntry<T>>,
}

unsafe impl<T: Send + Sync> Send for CacheHandle<T> {}
unsafe impl<T: Send + Sync> Sync for CacheHandle<T> {}

impl<T: Send + Sync> CacheHandle<T> {
    /// The cached value.
    pub fn value(&self) -> &T {
        unsafe {
            (*self.entry.as_ptr())
                .value
                .as_ref()
                .expect("handle to dead entry")
        }
    }
}

impl<T: Send + Sync> Drop for CacheHandle<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.unref(self.entry.as_ptr());
    }
}

/// A single LRU cache shard with a safe handle-based interface.
///
/// Capacity is expressed in charge units; each entry declares its own
/// charge at insertion.
pub struct LruCache<T: Send + Sync> {
    inner: Arc<LruCacheInner<T>>,
}

impl<T: Send + Sync> LruCache<T> {
    /// Create a cache holding at most `capacity` charge units.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LruCacheInner {
                state: Mutex::new(LruState {
                    capacity,
                    usage: 0,
                    lru: LruEntry::list_head(),
                    in_use: LruEntry::list_head(),
                    table: HandleTable::new(),
                }),
            }),
        }
    }

    /// Insert a mapping, returning a handle to it.
    ///
    /// A resident entry with the same key is displaced and destroyed once
    /// unpinned. With capacity zero the value is not cached at all; the
    /// returned handle is its only reference.
    pub fn insert(
        &self,
        key: &[u8],
        value: T,
        charge: usize,
        deleter: Option<Deleter<T>>,
    ) -> CacheHandle<T> {
        self.insert_with_hash(key, hash(key, 0), value, charge, deleter)
    }

    fn insert_with_hash(
        &self,
        key: &[u8],
        h: u32,
        value: T,
        charge: usize,
        deleter: Option<Deleter<T>>,
    ) -> CacheHandle<T> {
        let mut state = self.inner.state.lock();

        let e = Box::into_raw(Box::new(LruEntry {
            value: Some(value),
            deleter,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge,
            key: Box::from(key),
            hash: h,
            in_cache: false,
            refs: 1, // for the returned handle
        }));

        unsafe {
            if state.capacity > 0 {
                (*e).refs += 1; // for the cache's reference
                (*e).in_cache = true;
                list_append(state.in_use, e);
                state.usage += charge;
                let old = state.table.insert(e);
                state.finish_erase(old);
            }
            // With capacity zero caching is turned off entirely.

            while state.usage > state.capacity && (*state.lru).next != state.lru {
                let old = (*state.lru).next;
                debug_assert_eq!((*old).refs, 1);
                let old_key =
                    std::slice::from_raw_parts((*old).key.as_ptr(), (&(*old).key).len());
                let removed = state.table.remove(old_key, (*old).hash);
                debug_assert_eq!(removed, old);
                state.finish_erase(removed);
            }
        }

        CacheHandle {
            inner: Arc::clone(&self.inner),
            entry: NonNull::new(e).expect("boxed entry is non-null"),
        }
    }

    /// Look up a key, pinning the entry on a hit.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<T>> {
        self.lookup_with_hash(key, hash(key, 0))
    }

    fn lookup_with_hash(&self, key: &[u8], h: u32) -> Option<CacheHandle<T>> {
        let mut state = self.inner.state.lock();
        let e = state.table.lookup(key, h);
        if e.is_null() {
            return None;
        }
        state.ref_entry(e);
        Some(CacheHandle {
            inner: Arc::clone(&self.inner),
            entry: NonNull::new(e).expect("table entries are non-null"),
        })
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn release(&self, handle: CacheHandle<T>) {
        drop(handle);
    }

    /// Drop any resident entry for `key`. Outstanding handles keep the
    /// value alive; the deleter runs when the last one goes.
    pub fn erase(&self, key: &[u8]) {
        self.erase_with_hash(key, hash(key, 0))
    }

    fn erase_with_hash(&self, key: &[u8], h: u32) {
        let mut state = self.inner.state.lock();
        let e = state.table.remove(key, h);
        state.finish_erase(e);
    }

    /// Evict everything not currently pinned.
    pub fn prune(&self) {
        let mut state = self.inner.state.lock();
        unsafe {
            while (*state.lru).next != state.lru {
                let e = (*state.lru).next;
                debug_assert_eq!((*e).refs, 1);
                let key = std::slice::from_raw_parts((*e).key.as_ptr(), (&(*e).key).len());
                let removed = state.table.remove(key, (*e).hash);
                debug_assert_eq!(removed, e);
                state.finish_erase(removed);
            }
        }
    }

    /// Combined charge of all resident entries.
    pub fn total_charge(&self) -> usize {
        self.inner.state.lock().usage
    }
}

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// LRU cache split into [`NUM_SHARDS`] independently locked shards.
pub struct ShardedLruCache<T: Send + Sync> {
    shards: Vec<LruCache<T>>,
    /// Generator for ids that keep cache keys distinct across clients.
    last_id: Mutex<u64>,
}

fn shard_of(h: u32) -> usize {
    (h >> (32 - NUM_SHARD_BITS)) as usize
}

impl<T: Send + Sync> ShardedLruCache<T> {
    /// Create a cache of `capacity` total charge units, split evenly
    /// across the shards.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        Self {
            shards: (0..NUM_SHARDS).map(|_| LruCache::new(per_shard)).collect(),
            last_id: Mutex::new(0),
        }
    }

    /// Insert a mapping; see [`LruCache::insert`].
    pub fn insert(
        &self,
        key: &[u8],
        value: T,
        charge: usize,
        deleter: Option<Deleter<T>>,
    ) -> CacheHandle<T> {
        let h = hash(key, 0);
        self.shards[shard_of(h)].insert_with_hash(key, h, value, charge, deleter)
    }

    /// Look up a key; see [`LruCache::lookup`].
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<T>> {
        let h = hash(key, 0);
        self.shards[shard_of(h)].lookup_with_hash(key, h)
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn release(&self, handle: CacheHandle<T>) {
        drop(handle);
    }

    /// Drop any resident entry for `key`; see [`LruCache::erase`].
    pub fn erase(&self, key: &[u8]) {
        let h = hash(key, 0);
        self.shards[shard_of(h)].erase_with_hash(key, h)
    }

    /// Evict all unpinned entries from every shard.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.prune();
        }
    }

    /// Combined charge across shards.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.total_charge()).sum()
    }

    /// A new id, distinct from every id previously returned. Clients
    /// partition a shared cache's key space by prefixing keys with one.
    pub fn new_id(&self) -> u64 {
        let mut last_id = self.last_id.lock();
        *last_id += 1;
        *last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deleter_counting(counter: &Arc<AtomicUsize>) -> Option<Deleter<u32>> {
        let counter = Arc::clone(counter);
        Some(Box::new(move |_key, _value| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    /// Walk a shard's lists and check the structural invariants.
    fn assert_shard_invariants<T: Send + Sync>(cache: &LruCache<T>) {
        let state = cache.inner.state.lock();
        unsafe {
            let mut total = 0usize;
            let mut entries = 0usize;

            let mut e = (*state.lru).next;
            while e != state.lru {
                assert_eq!((*e).refs, 1, "lru entries hold only the cache ref");
                assert!((*e).in_cache);
                total += (*e).charge;
                entries += 1;
                e = (*e).next;
            }

            let mut e = (*state.in_use).next;
            while e != state.in_use {
                assert!((*e).refs >= 2, "in_use entries are client pinned");
                assert!((*e).in_cache);
                total += (*e).charge;
                entries += 1;
                e = (*e).next;
            }

            assert_eq!(total, state.usage, "usage equals sum of live charges");
            assert_eq!(entries, state.table.elems, "lists match table membership");
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache: LruCache<u32> = LruCache::new(100);
        assert!(cache.lookup(b"100").is_none());

        let h = cache.insert(b"100", 101, 1, None);
        drop(h);

        let h = cache.lookup(b"100").unwrap();
        assert_eq!(*h.value(), 101);
        drop(h);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_eviction_order() {
        // Capacity 3: A, B, C inserted and released, A re-referenced, then
        // D inserted. B is the oldest unreferenced entry and is evicted.
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(3);

        cache.release(cache.insert(b"A", 1, 1, deleter_counting(&deletions)));
        cache.release(cache.insert(b"B", 2, 1, deleter_counting(&deletions)));
        cache.release(cache.insert(b"C", 3, 1, deleter_counting(&deletions)));
        assert_eq!(deletions.load(Ordering::SeqCst), 0);

        let a = cache.lookup(b"A").unwrap();
        cache.release(cache.insert(b"D", 4, 1, deleter_counting(&deletions)));

        assert!(cache.lookup(b"B").is_none(), "B was the LRU victim");
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert_eq!(*a.value(), 1);
        assert_eq!(*cache.lookup(b"C").unwrap().value(), 3);
        assert_eq!(*cache.lookup(b"D").unwrap().value(), 4);

        drop(a);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_pinned_entries_survive_overflow() {
        let cache: LruCache<u32> = LruCache::new(2);

        let a = cache.insert(b"A", 1, 1, None);
        let b = cache.insert(b"B", 2, 1, None);
        // Both pinned; inserting more overflows but cannot evict them.
        cache.release(cache.insert(b"C", 3, 1, None));
        cache.release(cache.insert(b"D", 4, 1, None));

        assert_eq!(*a.value(), 1);
        assert_eq!(*b.value(), 2);
        assert!(cache.lookup(b"A").is_some());
        assert!(cache.lookup(b"B").is_some());
        assert_shard_invariants(&cache);
        drop(a);
        drop(b);
    }

    #[test]
    fn test_duplicate_insert_displaces_old() {
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(100);

        cache.release(cache.insert(b"k", 1, 1, deleter_counting(&deletions)));
        cache.release(cache.insert(b"k", 2, 1, deleter_counting(&deletions)));

        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert_eq!(*cache.lookup(b"k").unwrap().value(), 2);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_erase_with_outstanding_handle_defers_deleter() {
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(100);

        let h = cache.insert(b"k", 7, 1, deleter_counting(&deletions));
        cache.erase(b"k");

        // Still alive through the handle.
        assert_eq!(deletions.load(Ordering::SeqCst), 0);
        assert_eq!(*h.value(), 7);
        assert!(cache.lookup(b"k").is_none());

        drop(h);
        assert_eq!(deletions.load(Ordering::SeqCst), 1);

        // Erasing a missing key is a no-op.
        cache.erase(b"k");
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_usage_tracks_charges() {
        let cache: LruCache<u32> = LruCache::new(1000);
        cache.release(cache.insert(b"a", 1, 10, None));
        cache.release(cache.insert(b"b", 2, 200, None));
        assert_eq!(cache.total_charge(), 210);

        cache.erase(b"a");
        assert_eq!(cache.total_charge(), 200);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_heavy_entry_evicts_many() {
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(10);

        for i in 0..10u32 {
            cache.release(cache.insert(&[i as u8], i, 1, deleter_counting(&deletions)));
        }
        assert_eq!(cache.total_charge(), 10);

        // A charge-6 entry forces out the six oldest.
        cache.release(cache.insert(b"big", 99, 6, deleter_counting(&deletions)));
        assert_eq!(deletions.load(Ordering::SeqCst), 6);
        assert!(cache.total_charge() <= 10);
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(0);

        let h = cache.insert(b"k", 1, 1, deleter_counting(&deletions));
        assert_eq!(*h.value(), 1);
        assert!(cache.lookup(b"k").is_none());

        drop(h);
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn test_prune_removes_unpinned() {
        let deletions = Arc::new(AtomicUsize::new(0));
        let cache: LruCache<u32> = LruCache::new(100);

        let pinned = cache.insert(b"pinned", 1, 1, deleter_counting(&deletions));
        cache.release(cache.insert(b"loose", 2, 1, deleter_counting(&deletions)));

        cache.prune();
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert!(cache.lookup(b"loose").is_none());
        assert!(cache.lookup(b"pinned").is_some());
        assert_shard_invariants(&cache);
        drop(pinned);
    }

    #[test]
    fn test_many_entries_resize_table() {
        let cache: LruCache<u32> = LruCache::new(100_000);
        for i in 0..5000u32 {
            cache.release(cache.insert(&i.to_le_bytes(), i, 1, None));
        }
        for i in 0..5000u32 {
            assert_eq!(*cache.lookup(&i.to_le_bytes()).unwrap().value(), i);
        }
        assert_shard_invariants(&cache);
    }

    #[test]
    fn test_sharded_cache_basics() {
        let cache: ShardedLruCache<String> = ShardedLruCache::new(1600);
        for i in 0..100u32 {
            let key = format!("key{:04}", i);
            cache.release(cache.insert(key.as_bytes(), format!("v{}", i), 1, None));
        }
        for i in 0..100u32 {
            let key = format!("key{:04}", i);
            let h = cache.lookup(key.as_bytes()).unwrap();
            assert_eq!(h.value(), &format!("v{}", i));
        }
        assert_eq!(cache.total_charge(), 100);

        cache.erase(b"key0042");
        assert!(cache.lookup(b"key0042").is_none());

        cache.prune();
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn test_new_id_is_monotonic() {
        let cache: ShardedLruCache<u32> = ShardedLruCache::new(10);
        let a = cache.new_id();
        let b = cache.new_id();
        assert!(b > a);
    }

    #[test]
    fn test_concurrent_access() {
        let cache: Arc<ShardedLruCache<u64>> = Arc::new(ShardedLruCache::new(512));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..2000u64 {
                        let key = ((t * 1000 + i) % 700).to_le_bytes();
                        if let Some(h) = cache.lookup(&key) {
                            let _ = *h.value();
                        } else {
                            cache.release(cache.insert(&key, i, 1, None));
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(cache.total_charge() <= 512);
    }
}
