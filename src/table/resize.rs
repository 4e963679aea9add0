//! Builds replacement table bodies.
//!
//! A rebuild walks the source body's iteration list (cheaper than the
//! slot array, and it skips tombstones for free), carries every live
//! entry into a fresh body, and hands the unpublished result back to the
//! writer. Capacities double on overflow until everything fits.

use std::sync::atomic::Ordering;

use super::layout::{decode_tag, Body, SlotState, MIN_CAPACITY, NIL};
use super::probe;
use crate::mix::avalanche;
use crate::TableError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Policy {
    Grow,
    Rehash,
    Shrink,
}

/// Policy for an insert-overflow rebuild. Shrinking never happens here;
/// it is reserved for the explicit post-remove trigger.
pub(crate) fn pick_for_insert(capacity: usize, live: usize, rehash_ratio: usize) -> Policy {
    if live < capacity / rehash_ratio {
        Policy::Rehash
    } else {
        Policy::Grow
    }
}

/// Build an unpublished replacement for `src` with the live entries
/// carried over. Every retry re-mixes the salt and at least doubles the
/// capacity, so the loop terminates.
pub(crate) fn rebuild<K, V>(
    src: &Body<K, V>,
    policy: Policy,
    probe_limit: usize,
    hazard_slots: usize,
) -> Result<Box<Body<K, V>>, TableError> {
    let mut capacity = match policy {
        Policy::Shrink => (src.capacity() / 2).max(MIN_CAPACITY),
        Policy::Rehash => src.capacity(),
        Policy::Grow => src.capacity() * 2,
    };
    let mut salt = avalanche(src.salt, 0);
    loop {
        let body = Body::try_new(capacity, salt, hazard_slots)?;
        if transplant(src, &body, probe_limit) {
            return Ok(body);
        }
        capacity *= 2;
        salt = avalanche(salt, 0);
    }
}

/// Carry every live entry of `src` into `dst`. Returns false when some
/// entry exhausts its probe window in `dst`.
///
/// Handles are copied, not re-boxed: after publication the entries are
/// owned through `dst`, while `src` keeps read-only aliases for readers
/// still pinning it.
fn transplant<K, V>(src: &Body<K, V>, dst: &Body<K, V>, probe_limit: usize) -> bool {
    let mut idx = src.iter_head.load(Ordering::Relaxed);
    while idx != NIL {
        let slot = &src.slots[idx];
        if let SlotState::Live(tag) = decode_tag(slot.tag.load(Ordering::Relaxed)) {
            let Some(at) = probe::transplant_probe(dst, probe_limit, tag) else {
                return false;
            };
            let target = &dst.slots[at];
            // `dst` is still private to the writer; plain stores suffice.
            unsafe {
                *target.key.get() = *slot.key.get();
                *target.value.get() = *slot.value.get();
            }
            target
                .iter_next
                .store(dst.iter_head.load(Ordering::Relaxed), Ordering::Relaxed);
            target.tag.store(tag, Ordering::Relaxed);
            dst.iter_head.store(at, Ordering::Relaxed);
        }
        idx = slot.iter_next.load(Ordering::Relaxed);
    }
    true
}
