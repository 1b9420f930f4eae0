//! The two-tier LRU cache (spec.md §4.4 "Memory manager (host)" and §4.5
//! "Memory manager (GPU)").
//!
//! A single generic [`MemoryManager<T>`] implements both tiers; the only
//! difference between the host and GPU flavor is the refcount a freshly
//! stored item starts at (spec.md §3 "Cache entry (GPU)": a fresh store is
//! blocked with refcount -1 until the first consumer calls `get`).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::ReentrantMutex;

use wxvis_core::error::PipelineError;
use wxvis_core::item::CacheSized;
use wxvis_core::request::Request;

/// Which refcount discipline a manager uses on a fresh `store`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTier {
    /// Host-resident items start active with refcount 1.
    Host,
    /// Device-resident items start "stored but unreferenced": refcount
    /// -1, promoted to 1 by the first `get`.
    Device,
}

struct ActiveEntry<T> {
    item: Arc<T>,
    refcount: i64,
    size_kb: u64,
}

struct Inner<T> {
    active: FxHashMap<String, ActiveEntry<T>>,
    released: FxHashMap<String, (Arc<T>, u64)>,
    /// Released keys in eviction order, oldest (first released) at the
    /// front. A key never appears more than once.
    lru: VecDeque<String>,
    usage_kb: u64,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Inner {
            active: FxHashMap::default(),
            released: FxHashMap::default(),
            lru: VecDeque::new(),
            usage_kb: 0,
        }
    }
}

/// A byte-budgeted, reference-counted LRU cache. Two instances normally
/// exist in a running pipeline: one for host-resident [`wxvis_core::DataItem`]s
/// and one for device-resident [`wxvis_core::GpuBufferItem`]s.
pub struct MemoryManager<T> {
    identifier: String,
    limit_kb: u64,
    tier: CacheTier,
    inner: ReentrantMutex<RefCell<Inner<T>>>,
}

impl<T> std::fmt::Debug for MemoryManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemoryManager(\"{}\", tier={:?}, limit_kb={})",
            self.identifier, self.tier, self.limit_kb
        )
    }
}

impl<T> MemoryManager<T> {
    /// Constructs a manager with the given byte budget (in KiB) and owner
    /// tag. `identifier` prefixes nothing by itself -- the owner-scoped
    /// storage key is `"<owner>/<canonical request>"`, where `owner` is
    /// supplied by callers per source, not by the manager -- but it is used
    /// in logging and the debug dump.
    pub fn new(identifier: impl Into<String>, limit_kb: u64, tier: CacheTier) -> Arc<Self> {
        Arc::new(MemoryManager {
            identifier: identifier.into(),
            limit_kb,
            tier,
            inner: ReentrantMutex::new(RefCell::new(Inner::new())),
        })
    }

    fn storage_key(owner: &str, request: &Request) -> String {
        format!("{}/{}", owner, request.to_canonical_string())
    }

    /// Attempts to acquire a reference on an already-known key: promotes a
    /// released entry back to active (refcount reset to 1), or bumps an
    /// active entry's refcount (promoting a GPU item's blocked -1 sentinel
    /// to 1 on its first consumer). Returns `None` if the key is unknown.
    fn try_acquire_locked(inner: &mut Inner<T>, key: &str) -> Option<Arc<T>> {
        if let Some(entry) = inner.active.get_mut(key) {
            entry.refcount = if entry.refcount < 0 { 1 } else { entry.refcount + 1 };
            return Some(entry.item.clone());
        }
        if let Some((item, size_kb)) = inner.released.remove(key) {
            inner.lru.retain(|k| k != key);
            inner.active.insert(
                key.to_string(),
                ActiveEntry {
                    item: item.clone(),
                    refcount: 1,
                    size_kb,
                },
            );
            return Some(item);
        }
        None
    }

    /// `get(request) -> item`: returns the item and, on hit, increments
    /// its reference count. The caller must later call [`MemoryManager::release`].
    pub fn get(&self, owner: &str, request: &Request) -> Option<Arc<T>> {
        let key = Self::storage_key(owner, request);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let result = Self::try_acquire_locked(&mut inner, &key);
        log::trace!(target: "wxvis_cache", "get({}) -> {}", key, result.is_some());
        result
    }

    /// `contains(request) -> bool`: identical side effects to `get`, but
    /// discards the item. A caller observing `true` must later `release`.
    pub fn contains(&self, owner: &str, request: &Request) -> bool {
        self.get(owner, request).is_some()
    }

    /// Returns an active item without touching its reference count, for a
    /// caller who already owns a reference acquired some other way (the
    /// producer's implicit store-time reference, or a joiner's reference
    /// from `contains` during `acquire_additional_reference`). Unlike `get`,
    /// never promotes a released entry back to active -- the caller is
    /// expected to already be one of the entry's active owners.
    pub fn peek(&self, owner: &str, request: &Request) -> Option<Arc<T>> {
        let key = Self::storage_key(owner, request);
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.active.get(&key).map(|entry| entry.item.clone())
    }

    /// Stores a freshly produced item under `(owner, request)`, evicting
    /// released entries in release order until the byte budget is
    /// satisfied. Returns the stored item and whether this call actually
    /// inserted it (`false` means the key was already present, and the
    /// pre-existing item -- possibly just promoted from released to active
    /// -- is returned unchanged, per spec.md's store-idempotence law).
    pub fn store(
        &self,
        owner: &str,
        request: &Request,
        item: T,
        size_kb: u64,
    ) -> Result<(Arc<T>, bool), PipelineError>
    where
        T: CacheSized,
    {
        let key = Self::storage_key(owner, request);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if let Some(existing) = Self::try_acquire_locked(&mut inner, &key) {
            log::warn!(
                target: "wxvis_cache",
                "store() for {} declined, request key already exists",
                key
            );
            return Ok((existing, false));
        }

        while inner.usage_kb + size_kb > self.limit_kb {
            let Some(evict_key) = inner.lru.pop_front() else {
                break;
            };
            if let Some((_, evict_size)) = inner.released.remove(&evict_key) {
                inner.usage_kb -= evict_size;
                log::debug!(target: "wxvis_cache", "evicted {} ({} kb)", evict_key, evict_size);
            }
        }

        if inner.usage_kb + size_kb > self.limit_kb {
            log::warn!(
                target: "wxvis_cache",
                "{}: system memory limit exceeded, cannot release any further data fields",
                self.identifier
            );
            return Err(PipelineError::Memory(format!(
                "{}: cannot admit {} kb (usage {} kb, limit {} kb)",
                self.identifier, size_kb, inner.usage_kb, self.limit_kb
            )));
        }

        let arc = Arc::new(item);
        let refcount = match self.tier {
            CacheTier::Host => 1,
            CacheTier::Device => -1,
        };
        inner.active.insert(
            key.clone(),
            ActiveEntry {
                item: arc.clone(),
                refcount,
                size_kb,
            },
        );
        inner.usage_kb += size_kb;
        log::debug!(target: "wxvis_cache", "stored {} ({} kb, refcount {})", key, size_kb, refcount);
        Ok((arc, true))
    }

    /// Decrements the reference count of `(owner, request)`. At zero, the
    /// entry moves from active to released and becomes eligible for
    /// eviction in LRU order.
    pub fn release(&self, owner: &str, request: &Request) -> Result<(), PipelineError> {
        let key = Self::storage_key(owner, request);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let Some(entry) = inner.active.get_mut(&key) else {
            return Err(PipelineError::Memory(format!(
                "release of item not currently active: {}",
                key
            )));
        };
        entry.refcount -= 1;
        log::trace!(target: "wxvis_cache", "release({}) -> refcount {}", key, entry.refcount);
        if entry.refcount <= 0 {
            let entry = inner.active.remove(&key).unwrap();
            inner
                .released
                .insert(key.clone(), (entry.item, entry.size_kb));
            inner.lru.push_back(key);
        }
        Ok(())
    }

    /// GPU convenience for callers (rendering code) that may hold an
    /// unknown number of references to the same item: collapses the
    /// refcount to 1, then releases once.
    pub fn release_all_references(&self, owner: &str, request: &Request) -> Result<(), PipelineError> {
        let key = Self::storage_key(owner, request);
        {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            if let Some(entry) = inner.active.get_mut(&key) {
                entry.refcount = 1;
            }
        }
        self.release(owner, request)
    }

    /// GPU-only: items may resize (a buffer re-uploaded at a new length);
    /// this adjusts the manager's usage accounting without touching the
    /// stored item itself.
    pub fn update_item_size(
        &self,
        owner: &str,
        request: &Request,
        new_size_kb: u64,
    ) -> Result<(), PipelineError> {
        let key = Self::storage_key(owner, request);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Some(entry) = inner.active.get_mut(&key) else {
            return Err(PipelineError::Memory(format!(
                "update_item_size on item not active: {}",
                key
            )));
        };
        let old_size = entry.size_kb;
        entry.size_kb = new_size_kb;
        if new_size_kb >= old_size {
            inner.usage_kb += new_size_kb - old_size;
        } else {
            inner.usage_kb -= old_size - new_size_kb;
        }
        Ok(())
    }

    /// Total bytes (in KiB) currently accounted for across active and
    /// released entries. Invariant: always equal to the sum of every
    /// entry's recorded size.
    pub fn usage_kb(&self) -> u64 {
        let guard = self.inner.lock();
        let usage_kb = guard.borrow().usage_kb;
        usage_kb
    }

    pub fn limit_kb(&self) -> u64 {
        self.limit_kb
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Drops every released entry immediately, freeing its budget.
    pub fn clear_released(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        for key in inner.lru.drain(..).collect::<Vec<_>>() {
            if let Some((_, size)) = inner.released.remove(&key) {
                inner.usage_kb -= size;
            }
        }
    }

    /// Destroys every entry, active or released, regardless of refcount
    /// (spec.md §3 "Lifecycle": "At shutdown, active items are destroyed
    /// regardless of refcount").
    pub fn shutdown(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.active.clear();
        inner.released.clear();
        inner.lru.clear();
        inner.usage_kb = 0;
    }

    /// A human-readable dump of active and released entries, in the
    /// original implementation's `dumpMemoryContent()` spirit.
    pub fn debug_dump(&self) -> String {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut s = format!(
            "memory cache content ({})\nactive items:\n",
            self.identifier
        );
        for (key, entry) in inner.active.iter() {
            s.push_str(&format!(
                "  {} size={}kb refcount={}\n",
                key, entry.size_kb, entry.refcount
            ));
        }
        s.push_str("released items (LRU order):\n");
        for key in inner.lru.iter() {
            if let Some((_, size)) = inner.released.get(key) {
                s.push_str(&format!("  {} size={}kb\n", key, size));
            }
        }
        s
    }
}
