//! Insert and lookup probe walks over a table body.
//!
//! Probing is re-hash chaining of bounded length: from a key's mixed hash
//! `h`, up to `probe_limit` slots at `h & mask` are visited, each
//! successive `h` being the mixer applied to the previous one with the
//! body's salt. A walk that exhausts the window without a decision makes
//! the caller rebuild the body.

use std::sync::atomic::Ordering;

use super::layout::{decode_tag, Body, SlotState};
use crate::mix::avalanche;

/// Outcome of an insert probe.
pub(crate) enum InsertProbe {
    /// First empty slot on the probe sequence.
    At(usize),
    /// A live entry with an equal key already exists.
    Exists,
    /// Probe window exhausted without an empty slot.
    Full,
}

/// Walk the probe sequence for `hash`, deciding where an insert lands.
///
/// Tombstones are skipped and never reused. An empty slot at step `i`
/// also proves the key is absent from later steps: the key would have
/// been placed there, and slots never return to empty within a body.
pub(crate) fn insert_probe<K: Eq, V>(
    body: &Body<K, V>,
    probe_limit: usize,
    hash: u64,
    key: &K,
) -> InsertProbe {
    let mut h = hash;
    for _ in 0..probe_limit {
        let idx = (h as usize) & body.mask;
        let slot = &body.slots[idx];
        match decode_tag(slot.tag.load(Ordering::Acquire)) {
            SlotState::Empty => return InsertProbe::At(idx),
            SlotState::Tomb => {}
            SlotState::Live(tag) => {
                // Equal keys mix to equal tags, so a tag mismatch skips
                // the key dereference entirely.
                // Safety: the acquire load of a live tag orders the key
                // store before this read, and live slots are never
                // rewritten.
                if tag == hash && key == unsafe { &**slot.key.get() } {
                    return InsertProbe::Exists;
                }
            }
        }
        h = avalanche(h, body.salt);
    }
    InsertProbe::Full
}

/// Find an empty slot for an entry carried over during a rebuild.
///
/// Uniqueness is already known, so no key comparison happens; the stored
/// tag is the probe seed.
pub(crate) fn transplant_probe<K, V>(
    body: &Body<K, V>,
    probe_limit: usize,
    hash: u64,
) -> Option<usize> {
    let mut h = hash;
    for _ in 0..probe_limit {
        let idx = (h as usize) & body.mask;
        if matches!(
            decode_tag(body.slots[idx].tag.load(Ordering::Relaxed)),
            SlotState::Empty
        ) {
            return Some(idx);
        }
        h = avalanche(h, body.salt);
    }
    None
}

/// Walk the probe sequence for a live entry equal to `key`.
///
/// Continues past tombstones (transient occlusions of earlier probe
/// slots) and past empties (a racing insert may not have published its
/// tag yet); only exhaustion ends the walk.
pub(crate) fn lookup_probe<K: Eq, V>(
    body: &Body<K, V>,
    probe_limit: usize,
    hash: u64,
    key: &K,
) -> Option<usize> {
    let mut h = hash;
    for _ in 0..probe_limit {
        let idx = (h as usize) & body.mask;
        let slot = &body.slots[idx];
        if let SlotState::Live(tag) = decode_tag(slot.tag.load(Ordering::Acquire)) {
            // Safety: as in `insert_probe`.
            if tag == hash && key == unsafe { &**slot.key.get() } {
                return Some(idx);
            }
        }
        h = avalanche(h, body.salt);
    }
    None
}
