//! Writer-exclusion latch.
//!
//! A test-and-set flag gating acquisition of the writer handle. With a
//! single writer it is uncontended; when several threads want to write it
//! serializes them into one writer at a time.

use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct WriterLatch {
    locked: AtomicBool,
}

impl WriterLatch {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        self.acquire_slow();
    }

    #[cold]
    fn acquire_slow(&self) {
        loop {
            // Spin read-only until the flag looks free.
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            if self.try_acquire() {
                return;
            }
        }
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion() {
        let latch = WriterLatch::new();
        assert!(latch.try_acquire());
        assert!(!latch.try_acquire());
        latch.release();
        assert!(latch.try_acquire());
        latch.release();
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        use std::sync::Arc;

        let latch = Arc::new(WriterLatch::new());
        assert!(latch.try_acquire());

        let l2 = Arc::clone(&latch);
        let waiter = std::thread::spawn(move || {
            l2.acquire();
            l2.release();
        });

        latch.release();
        waiter.join().unwrap();
    }
}
