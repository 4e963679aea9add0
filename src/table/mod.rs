//! Shared table core and the writer and reader facades.
//!
//! The long-lived root holds the current-body pointer, the hazard
//! registry, and the retired-body list. One [`Writer`] (gated by a
//! test-and-set latch) mutates slots in place and swaps whole bodies on
//! resize; [`Reader`]s pin the current body through their hazard counter
//! before touching it.

mod hazard;
mod latch;
mod layout;
mod probe;
mod resize;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::mix::avalanche;
use crate::{Options, TableError};
use hazard::{HazardGuard, HazardRegistry};
use latch::WriterLatch;
use layout::{decode_tag, Body, SlotState, NIL, TAG_TOMB};
use probe::InsertProbe;

struct Core<K, V, S> {
    /// Always non-null; points at the current, fully initialized body.
    current: AtomicPtr<Body<K, V>>,
    hazards: HazardRegistry,
    /// Retired bodies awaiting proof that no reader still observes them.
    retired: Mutex<Vec<Box<Body<K, V>>>>,
    /// Mirror of the current body's capacity, so `capacity()` needs no
    /// hazard pin.
    capacity: AtomicUsize,
    /// Live-entry count. Written by the writer only.
    live: AtomicUsize,
    /// Gates acquisition of the writer handle.
    latch: WriterLatch,
    /// Reader ids currently leased out through `reader()`.
    leases: Mutex<Box<[bool]>>,
    probe_limit: usize,
    rehash_ratio: usize,
    shrink_ratio: usize,
    /// Floor for shrinking and the capacity `clear` resets to.
    min_capacity: usize,
    build_hasher: S,
}

impl<K, V, S> Core<K, V, S> {
    /// The writer's plain view of the current body.
    ///
    /// # Safety
    /// Caller must be the writer (bodies are only retired by the writer,
    /// so the pointer stays valid for the duration of a writer call).
    unsafe fn writer_body(&self) -> &Body<K, V> {
        &*self.current.load(Ordering::Relaxed)
    }

    fn sweep_retired(&self, retired: &mut Vec<Box<Body<K, V>>>) {
        let before = retired.len();
        retired.retain(|body| !self.hazards.sweep(body));
        if before != retired.len() {
            trace!(
                freed = before - retired.len(),
                pending = retired.len(),
                "reclaimed retired bodies"
            );
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Core<K, V, S> {
    /// Mixed hash of a key; the mixer guarantees the result is a valid
    /// live tag.
    fn hash_of(&self, key: &K) -> u64 {
        avalanche(self.build_hasher.hash_one(key), 0)
    }
}

impl<K, V, S> Drop for Core<K, V, S> {
    fn drop(&mut self) {
        // Last handle gone: no writer, no readers. The current body still
        // owns its live entries; retired bodies free their own retired
        // lists when the vec drops.
        let cur = *self.current.get_mut();
        // Safety: exclusive access, and `current` is never null.
        unsafe {
            let body = &mut *cur;
            for slot in body.slots.iter_mut() {
                if let SlotState::Live(_) = decode_tag(*slot.tag.get_mut()) {
                    drop(Box::from_raw(*slot.key.get_mut() as *mut K));
                    drop(Box::from_raw(*slot.value.get_mut()));
                }
            }
            drop(Box::from_raw(cur));
        }
    }
}

/// Shared handle to a single-writer, many-reader hash table.
///
/// Cloning is cheap and shares the same table. Obtain the (unique) write
/// handle through [`writer`](Self::writer) and read handles through
/// [`reader`](Self::reader) or [`reader_at`](Self::reader_at).
pub struct SwmrTable<K, V, S = ahash::RandomState> {
    core: Arc<Core<K, V, S>>,
}

impl<K, V, S> Clone for SwmrTable<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: Hash + Eq, V> SwmrTable<K, V> {
    /// Create a table with default options and a random `ahash` state.
    pub fn new() -> Result<Self, TableError> {
        Self::with_options_and_hasher(Options::default(), ahash::RandomState::new())
    }

    pub fn with_options(options: Options) -> Result<Self, TableError> {
        Self::with_options_and_hasher(options, ahash::RandomState::new())
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> SwmrTable<K, V, S> {
    pub fn with_hasher(build_hasher: S) -> Result<Self, TableError> {
        Self::with_options_and_hasher(Options::default(), build_hasher)
    }

    pub fn with_options_and_hasher(options: Options, build_hasher: S) -> Result<Self, TableError> {
        let capacity = options
            .initial_capacity
            .next_power_of_two()
            .max(layout::MIN_CAPACITY);
        let hazard_slots = options.hazard_slots.max(1);
        let salt = avalanche((capacity * hazard_slots) as u64, 0);
        let body = Body::try_new(capacity, salt, hazard_slots)?;
        debug!(capacity, hazard_slots, "created table");
        Ok(Self {
            core: Arc::new(Core {
                current: AtomicPtr::new(Box::into_raw(body)),
                hazards: HazardRegistry::new(hazard_slots),
                retired: Mutex::new(Vec::new()),
                capacity: AtomicUsize::new(capacity),
                live: AtomicUsize::new(0),
                latch: WriterLatch::new(),
                leases: Mutex::new(vec![false; hazard_slots].into_boxed_slice()),
                probe_limit: options.probe_limit.max(1),
                rehash_ratio: options.rehash_ratio.max(1),
                shrink_ratio: options.shrink_ratio.max(1),
                min_capacity: capacity,
                build_hasher,
            }),
        })
    }
}

impl<K, V, S> SwmrTable<K, V, S> {
    /// Current slot-array capacity.
    pub fn capacity(&self) -> usize {
        self.core.capacity.load(Ordering::Relaxed)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.core.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reader registration slots (`H`).
    pub fn hazard_slots(&self) -> usize {
        self.core.hazards.len()
    }

    /// Acquire the write handle, or `None` while one is already out.
    pub fn writer(&self) -> Option<Writer<K, V, S>> {
        self.core.latch.try_acquire().then(|| Writer {
            core: Arc::clone(&self.core),
        })
    }

    /// Spin until the write handle becomes available.
    pub fn writer_blocking(&self) -> Writer<K, V, S> {
        self.core.latch.acquire();
        Writer {
            core: Arc::clone(&self.core),
        }
    }

    /// Lease a free reader id, or `None` when all of them are taken.
    pub fn reader(&self) -> Option<Reader<K, V, S>> {
        let mut leases = self.core.leases.lock();
        let id = leases.iter().position(|taken| !taken)?;
        leases[id] = true;
        Some(Reader {
            core: Arc::clone(&self.core),
            id,
            leased: true,
        })
    }

    /// Read handle for an explicit id in `[0, H)`.
    ///
    /// Several readers may share an id; the registration counter
    /// tolerates that, at the cost of delaying reclamation while any of
    /// them holds a pin.
    ///
    /// # Panics
    /// If `id` is out of range.
    pub fn reader_at(&self, id: usize) -> Reader<K, V, S> {
        assert!(
            id < self.core.hazards.len(),
            "reader id {id} out of range (hazard slots: {})",
            self.core.hazards.len()
        );
        Reader {
            core: Arc::clone(&self.core),
            id,
            leased: false,
        }
    }
}

/// Exclusive write handle. Dropping it releases the writer latch.
pub struct Writer<K, V, S = ahash::RandomState> {
    core: Arc<Core<K, V, S>>,
}

impl<K, V, S> Drop for Writer<K, V, S> {
    fn drop(&mut self) {
        self.core.latch.release();
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Writer<K, V, S> {
    /// Insert `key` → `value`. A key that is already present is left
    /// untouched (no value update) and the arguments are dropped.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), TableError> {
        let hash = self.core.hash_of(&key);
        // Replacement body produced by the resize engine, not yet
        // published.
        let mut fresh: Option<Box<Body<K, V>>> = None;
        let slot_idx = loop {
            let (decision, capacity) = {
                let body = match fresh.as_deref() {
                    Some(b) => b,
                    // Safety: we hold the writer latch.
                    None => unsafe { self.core.writer_body() },
                };
                (
                    probe::insert_probe(body, self.core.probe_limit, hash, &key),
                    body.capacity(),
                )
            };
            match decision {
                InsertProbe::Exists => return Ok(()),
                InsertProbe::At(idx) => break idx,
                InsertProbe::Full => {
                    let policy = if fresh.is_some() {
                        // Retrying on a body we just built: only growth
                        // can help.
                        resize::Policy::Grow
                    } else {
                        resize::pick_for_insert(
                            capacity,
                            self.core.live.load(Ordering::Relaxed),
                            self.core.rehash_ratio,
                        )
                    };
                    let src = match fresh.as_deref() {
                        Some(b) => b,
                        // Safety: we hold the writer latch.
                        None => unsafe { self.core.writer_body() },
                    };
                    let next = resize::rebuild(
                        src,
                        policy,
                        self.core.probe_limit,
                        self.core.hazards.len(),
                    )?;
                    fresh = Some(next);
                }
            }
        };

        // Populate, then publish: handles and the iteration link first,
        // the tag and the list head with release stores.
        {
            let body = match fresh.as_deref() {
                Some(b) => b,
                // Safety: we hold the writer latch.
                None => unsafe { self.core.writer_body() },
            };
            let slot = &body.slots[slot_idx];
            // Safety: the slot came back empty and tombstones are never
            // reused, so no reader is dereferencing these cells.
            unsafe {
                *slot.value.get() = Box::into_raw(Box::new(value));
                *slot.key.get() = Box::into_raw(Box::new(key));
            }
            slot.iter_next
                .store(body.iter_head.load(Ordering::Relaxed), Ordering::Relaxed);
            slot.tag.store(hash, Ordering::Release);
            body.iter_head.store(slot_idx, Ordering::Release);
        }
        self.core.live.fetch_add(1, Ordering::Relaxed);

        if let Some(body) = fresh {
            self.publish(body);
        }
        Ok(())
    }

    /// Remove `key`, returning a borrow of the removed value.
    ///
    /// The entry stays on the body's retired list until the body itself
    /// is reclaimed, so concurrent readers racing this removal keep a
    /// valid view; the returned borrow ends at the next writer call.
    pub fn remove(&mut self, key: &K) -> Option<&V> {
        let hash = self.core.hash_of(key);
        // Safety: we hold the writer latch.
        let body = unsafe { self.core.writer_body() };
        let idx = probe::lookup_probe(body, self.core.probe_limit, hash, key)?;
        let slot = &body.slots[idx];
        // Racing readers observe the entry as absent from here on.
        slot.tag.store(TAG_TOMB, Ordering::Relaxed);
        // Safety: writer only; the slot was live, so its handles are set.
        unsafe { body.push_retired(idx) };
        self.core.live.fetch_sub(1, Ordering::Relaxed);
        // Safety: the value box lives until the body is reclaimed, which
        // only a later `&mut self` call can trigger.
        Some(unsafe { &**slot.value.get() })
    }

    /// Remove every entry and publish a fresh floor-capacity body.
    pub fn clear(&mut self) -> Result<(), TableError> {
        let core = &*self.core;
        // Safety: we hold the writer latch.
        let body = unsafe { core.writer_body() };
        // Tombstone every live slot so the outgoing body owns, and later
        // frees, all remaining entries.
        let mut idx = body.iter_head.load(Ordering::Relaxed);
        while idx != NIL {
            let slot = &body.slots[idx];
            if let SlotState::Live(_) = decode_tag(slot.tag.load(Ordering::Relaxed)) {
                slot.tag.store(TAG_TOMB, Ordering::Relaxed);
                // Safety: writer only, slot was live.
                unsafe { body.push_retired(idx) };
            }
            idx = slot.iter_next.load(Ordering::Relaxed);
        }
        core.live.store(0, Ordering::Relaxed);
        let empty = Body::try_new(core.min_capacity, avalanche(body.salt, 0), core.hazards.len())?;
        self.publish(empty);
        Ok(())
    }

    /// Halve the capacity when the occupancy ratio allows it. This is the
    /// only shrinking path; insert-overflow rebuilds never shrink.
    pub fn maybe_shrink(&mut self) -> Result<bool, TableError> {
        let core = &*self.core;
        // Safety: we hold the writer latch.
        let body = unsafe { core.writer_body() };
        let capacity = body.capacity();
        let live = core.live.load(Ordering::Relaxed);
        if capacity / 2 < core.min_capacity || live >= capacity / core.shrink_ratio {
            return Ok(false);
        }
        let fresh = resize::rebuild(
            body,
            resize::Policy::Shrink,
            core.probe_limit,
            core.hazards.len(),
        )?;
        self.publish(fresh);
        Ok(true)
    }
}

impl<K, V, S> Writer<K, V, S> {
    /// Publish `body` as current and retire the outgoing one.
    fn publish(&mut self, body: Box<Body<K, V>>) {
        let core = &*self.core;
        let new_capacity = body.capacity();
        let new_ptr = Box::into_raw(body);
        let old_ptr = core.current.load(Ordering::Relaxed);
        core.current.store(new_ptr, Ordering::Release);
        core.capacity.store(new_capacity, Ordering::Relaxed);
        // Store-load barrier: the publication store must not reorder
        // with the snapshot loads below. Past this point a reader that
        // is not in the snapshot can only load the new body.
        fence(Ordering::SeqCst);
        // Safety: `old_ptr` was the current body; only this writer frees
        // bodies, and only through the hazard snapshot taken here.
        let old = unsafe { Box::from_raw(old_ptr) };
        let pinned = core.hazards.snapshot_into(&old);
        debug!(
            old_capacity = old.capacity(),
            new_capacity, pinned, "published table body"
        );
        let mut retired = core.retired.lock();
        if pinned {
            retired.push(old);
        } else {
            // No reader can observe it; dropping frees its retired
            // entries right away.
            drop(old);
        }
        core.sweep_retired(&mut retired);
    }

    /// Run a reclamation sweep; returns the number of bodies still
    /// pinned by readers.
    pub fn try_reclaim(&mut self) -> usize {
        let mut retired = self.core.retired.lock();
        self.core.sweep_retired(&mut retired);
        retired.len()
    }

    /// Sweep until every retired body is reclaimed.
    ///
    /// Progress depends on reader liveness: a reader parked inside a
    /// callback holds its pin, and this spins until it releases.
    pub fn reclaim_all(&mut self) {
        while self.try_reclaim() != 0 {
            std::thread::yield_now();
        }
    }

    /// Number of retired bodies awaiting reclamation.
    pub fn pending_reclaim(&self) -> usize {
        self.core.retired.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.core.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read handle bound to one hazard-registration id.
pub struct Reader<K, V, S = ahash::RandomState> {
    core: Arc<Core<K, V, S>>,
    id: usize,
    leased: bool,
}

impl<K, V, S> Drop for Reader<K, V, S> {
    fn drop(&mut self) {
        if self.leased {
            self.core.leases.lock()[self.id] = false;
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Reader<K, V, S> {
    /// Apply `f` to the entry for `key`, if present.
    ///
    /// `f` runs under hazard protection and must not re-enter the table
    /// with this reader's id.
    pub fn apply<R>(&self, key: &K, f: impl FnOnce(&K, &V) -> R) -> Option<R> {
        let hash = self.core.hash_of(key);
        let _pin = HazardGuard::pin(&self.core.hazards, self.id);
        // Safety: the pin above orders this load after the counter
        // increment; the publication protocol keeps the body allocated
        // until the pin drops.
        let body = unsafe { &*self.core.current.load(Ordering::Acquire) };
        let idx = probe::lookup_probe(body, self.core.probe_limit, hash, key)?;
        let slot = &body.slots[idx];
        // Safety: `lookup_probe` saw a live tag with acquire ordering,
        // which orders the handle stores before these reads.
        let (k, v) = unsafe { (&**slot.key.get(), &**slot.value.get()) };
        Some(f(k, v))
    }

    /// Whether `key` currently has a live entry.
    pub fn contains(&self, key: &K) -> bool {
        self.apply(key, |_, _| ()).is_some()
    }
}

impl<K, V, S> Reader<K, V, S> {
    /// Visit every live entry; return `false` from `f` to stop early.
    ///
    /// Entries inserted or removed while the walk is in progress may or
    /// may not be seen, but an entry that stays untouched for the whole
    /// call is visited exactly once.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V) -> bool) {
        let _pin = HazardGuard::pin(&self.core.hazards, self.id);
        // Safety: as in `apply`.
        let body = unsafe { &*self.core.current.load(Ordering::Acquire) };
        let mut idx = body.iter_head.load(Ordering::Acquire);
        while idx != NIL {
            let slot = &body.slots[idx];
            let next = slot.iter_next.load(Ordering::Acquire);
            if let SlotState::Live(_) = decode_tag(slot.tag.load(Ordering::Acquire)) {
                // Safety: live tag read with acquire ordering; see
                // `apply`.
                let (k, v) = unsafe { (&**slot.key.get(), &**slot.value.get()) };
                if !f(k, v) {
                    break;
                }
            }
            idx = next;
        }
    }

    /// This reader's hazard id.
    pub fn id(&self) -> usize {
        self.id
    }
}
