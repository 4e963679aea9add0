//! Slot and table-body structures.
//!
//! A body is one fixed-capacity open-addressed slot array plus the
//! intrusive lists threaded through it. Bodies are immutable in shape:
//! the writer mutates slot contents in place and replaces the whole body
//! on resize. All cross-thread state is held in atomics; the remaining
//! cells are written by the writer only, under the publication protocol
//! of the parent module.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

use crate::TableError;

/// Tag of a slot that has never held an entry since body creation.
pub(crate) const TAG_EMPTY: u64 = 0;

/// Tag of a slot whose entry has been removed.
pub(crate) const TAG_TOMB: u64 = 1;

/// Index sentinel terminating the in-slot linked chains.
pub(crate) const NIL: usize = usize::MAX;

/// Smallest slot-array capacity; also the floor for shrinking.
pub(crate) const MIN_CAPACITY: usize = 128;

/// Decoded state of a slot tag.
///
/// Any tag other than the two reserved values is a live entry, and the
/// tag itself is the entry's mixed hash (the mixer never produces the
/// reserved values).
pub(crate) enum SlotState {
    Empty,
    Tomb,
    Live(u64),
}

pub(crate) fn decode_tag(tag: u64) -> SlotState {
    match tag {
        TAG_EMPTY => SlotState::Empty,
        TAG_TOMB => SlotState::Tomb,
        hash => SlotState::Live(hash),
    }
}

/// One cell of the slot array.
///
/// The tag is the only field readers synchronize on: the writer stores
/// the key and value handles first and publishes them with a release
/// store of the tag. Live slots are never rewritten (tombstones are not
/// reused), so a reader that has observed a live tag may dereference the
/// handles for as long as it holds the body pinned.
pub(crate) struct Slot<K, V> {
    /// 0 = empty, 1 = tombstone, anything else = the entry's mixed hash.
    pub(crate) tag: AtomicU64,
    pub(crate) key: UnsafeCell<*const K>,
    pub(crate) value: UnsafeCell<*mut V>,
    /// Next slot on the body's iteration list.
    pub(crate) iter_next: AtomicUsize,
    /// Next slot on the body's retired-entries list. Writer only.
    pub(crate) retired_next: UnsafeCell<usize>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            tag: AtomicU64::new(TAG_EMPTY),
            key: UnsafeCell::new(ptr::null()),
            value: UnsafeCell::new(ptr::null_mut()),
            iter_next: AtomicUsize::new(NIL),
            retired_next: UnsafeCell::new(NIL),
        }
    }
}

/// One table body: the slot array and everything scoped to its lifetime.
pub(crate) struct Body<K, V> {
    /// Capacity mask; the slot count is `mask + 1`, always a power of two.
    pub(crate) mask: usize,
    /// Per-body probe salt; re-mixed for every rebuild attempt.
    pub(crate) salt: u64,
    pub(crate) slots: Box<[Slot<K, V>]>,
    /// Head of the iteration list: every live slot is on it, tombstoned
    /// slots may linger, empty slots never appear.
    pub(crate) iter_head: AtomicUsize,
    /// Head of the retired-entries list. Writer only.
    pub(crate) retired_head: UnsafeCell<usize>,
    /// Per-reader hazard counters as seen when this body was retired.
    pub(crate) hazard_snapshot: Box<[AtomicU32]>,
}

// Readers on arbitrary threads borrow the stored keys and values, and a
// body may be dropped on whichever thread holds the last handle.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Body<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Body<K, V> {}

impl<K, V> Body<K, V> {
    /// Allocate an all-empty body. Fails (leaving no trace) if the slot
    /// array cannot be reserved.
    pub(crate) fn try_new(
        capacity: usize,
        salt: u64,
        hazard_slots: usize,
    ) -> Result<Box<Self>, TableError> {
        debug_assert!(capacity.is_power_of_two() && capacity >= MIN_CAPACITY);

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| TableError::Allocation {
                bytes: capacity * mem::size_of::<Slot<K, V>>(),
            })?;
        slots.resize_with(capacity, Slot::new);

        let hazard_snapshot = (0..hazard_slots)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Box::new(Self {
            mask: capacity - 1,
            salt,
            slots: slots.into_boxed_slice(),
            iter_head: AtomicUsize::new(NIL),
            retired_head: UnsafeCell::new(NIL),
            hazard_snapshot,
        }))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Push slot `idx` onto the retired-entries list, transferring
    /// ownership of its key and value handles to this body.
    ///
    /// # Safety
    /// Writer only, and `idx` must hold populated handles.
    pub(crate) unsafe fn push_retired(&self, idx: usize) {
        let head = self.retired_head.get();
        *self.slots[idx].retired_next.get() = *head;
        *head = idx;
    }
}

impl<K, V> Drop for Body<K, V> {
    fn drop(&mut self) {
        // A body owns exactly the entries on its retired list. Live
        // entries either moved to a newer body during a rebuild or are
        // freed by the shared core when the last handle goes away.
        let mut idx = *self.retired_head.get_mut();
        while idx != NIL {
            let slot = &mut self.slots[idx];
            let next = *slot.retired_next.get_mut();
            // Safety: retired handles were populated at insert and are
            // referenced by no newer body.
            unsafe {
                drop(Box::from_raw(*slot.key.get_mut() as *mut K));
                drop(Box::from_raw(*slot.value.get_mut()));
            }
            idx = next;
        }
    }
}
