//! Reader registration counters and the reclamation protocol.
//!
//! Each reader id owns one padded counter. A nonzero counter pins the
//! table body that was current when the counter was raised; the writer
//! snapshots all counters when it retires a body and may free the body
//! only once every snapshotted counter has been observed back at zero.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use super::layout::Body;

/// One reader-registration counter. `CachePadded` pads both sides so no
/// counter shares a cache line with another or with writer state.
struct HazardSlot {
    active: CachePadded<AtomicU32>,
}

pub(crate) struct HazardRegistry {
    slots: Box<[HazardSlot]>,
}

impl HazardRegistry {
    pub(crate) fn new(n: usize) -> Self {
        let slots = (0..n)
            .map(|_| HazardSlot {
                active: CachePadded::new(AtomicU32::new(0)),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Raise reader `id`'s counter. The acquire ordering keeps the
    /// subsequent current-body load from moving above the increment.
    pub(crate) fn acquire(&self, id: usize) {
        self.slots[id].active.fetch_add(1, Ordering::Acquire);
    }

    /// Lower reader `id`'s counter. Release ordering: the writer must not
    /// conclude the reader is done while its reads are still in flight.
    pub(crate) fn release(&self, id: usize) {
        self.slots[id].active.fetch_sub(1, Ordering::Release);
    }

    /// Snapshot every counter into the retiring body. Returns whether any
    /// counter was nonzero.
    ///
    /// Must run after the sequentially-consistent publication fence: past
    /// that point a reader that raised its counter too late to appear
    /// here can only have loaded the new body.
    pub(crate) fn snapshot_into<K, V>(&self, body: &Body<K, V>) -> bool {
        let mut any = 0;
        for (slot, snap) in self.slots.iter().zip(body.hazard_snapshot.iter()) {
            let cur = slot.active.load(Ordering::Relaxed);
            any |= cur;
            snap.store(cur, Ordering::Relaxed);
        }
        any != 0
    }

    /// One reclamation pass over a retired body. Returns true when no
    /// reader can still observe it.
    ///
    /// A snapshot entry may be cleared once the live counter reads zero:
    /// the pinning reader has released, and any later reader saw the
    /// newer body by the publication-fence argument.
    pub(crate) fn sweep<K, V>(&self, body: &Body<K, V>) -> bool {
        let mut quiescent = true;
        for (slot, snap) in self.slots.iter().zip(body.hazard_snapshot.iter()) {
            if snap.load(Ordering::Relaxed) != 0 {
                if slot.active.load(Ordering::Relaxed) == 0 {
                    // Synchronize with the reader's release-decrement
                    // before forgetting about it.
                    fence(Ordering::Acquire);
                    snap.store(0, Ordering::Relaxed);
                } else {
                    quiescent = false;
                }
            }
        }
        quiescent
    }
}

/// Pins the current body for one reader id; released on drop so a
/// panicking callback cannot leak a pin.
pub(crate) struct HazardGuard<'a> {
    registry: &'a HazardRegistry,
    id: usize,
}

impl<'a> HazardGuard<'a> {
    pub(crate) fn pin(registry: &'a HazardRegistry, id: usize) -> Self {
        registry.acquire(id);
        Self { registry, id }
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
