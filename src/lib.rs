//! Single-writer, many-reader concurrent hash table with hazard-based
//! memory reclamation.
//!
//! One designated [`Writer`] inserts and removes entries while any number
//! of [`Reader`]s (up to the configured hazard-slot count) look up and
//! iterate entries concurrently, without locks on the read path. The
//! writer never blocks on readers: when the table is rebuilt, the old slot
//! array is retired and reclaimed once per-reader hazard counters prove no
//! reader can still observe it.
//!
//! The table is open-addressed with a bounded probe window. A full probe
//! window triggers a rebuild (grow, or an in-place rehash with a fresh
//! probe salt when occupancy is low). Tombstones are never reused; they
//! are cleared by the next rehashing rebuild.

mod mix;
mod table;

pub use table::{Reader, SwmrTable, Writer};

use thiserror::Error;

/// Errors surfaced by table construction and rebuilding.
#[derive(Debug, Error)]
pub enum TableError {
    /// A slot array could not be allocated. The previous table body (if
    /// any) is still current and untouched.
    #[error("failed to allocate a table body of {bytes} bytes")]
    Allocation {
        /// Size of the failed slot-array allocation.
        bytes: usize,
    },
}

/// Tuning knobs for table creation.
#[derive(Clone, Debug)]
pub struct Options {
    /// Initial slot-array capacity. Rounded up to a power of two with a
    /// floor of 128; also the floor below which the table never shrinks.
    pub initial_capacity: usize,
    /// Number of reader registration slots (`H`). One concurrent reader
    /// per slot; ids may be shared at the cost of delayed reclamation.
    pub hazard_slots: usize,
    /// Candidate slots examined per key before the table counts as full.
    pub probe_limit: usize,
    /// A full table is rehashed in place (same capacity, fresh salt) when
    /// fewer than `capacity / rehash_ratio` entries are live.
    pub rehash_ratio: usize,
    /// `maybe_shrink` halves the table when fewer than
    /// `capacity / shrink_ratio` entries are live.
    pub shrink_ratio: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            initial_capacity: 128,
            hazard_slots: 8,
            probe_limit: 2,
            rehash_ratio: 5,
            shrink_ratio: 10,
        }
    }
}
