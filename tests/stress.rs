//! Concurrent stress: readers racing a churning writer across rebuilds,
//! and reclamation held up by a reader parked inside its callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use swmr_table::SwmrTable;

const VALUE_MUL: u64 = 0x9e37_79b9_7f4a_7c15;

fn value_of(key: u64) -> u64 {
    key.wrapping_mul(VALUE_MUL)
}

/// The multiplicative RNG the original benchmark harness used.
fn next_rand(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(2_862_933_555_777_941_757)
        .wrapping_add(3_037_000_493);
    *state >> 32
}

#[test]
fn readers_race_a_churning_writer() {
    const KEYS: u64 = 2_000;
    const LOOKUPS: usize = 200_000;
    const READERS: usize = 3;

    let table = SwmrTable::<u64, u64>::new().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let mut w = table.writer().unwrap();
    for k in 0..KEYS {
        w.insert(k, value_of(k)).unwrap();
    }

    let mut readers = Vec::new();
    for t in 0..READERS {
        let table = table.clone();
        readers.push(thread::spawn(move || {
            let reader = table.reader().expect("free reader id");
            let mut rng = 0x243f_6a88_85a3_08d3u64 ^ (t as u64);
            let mut found = 0usize;
            for _ in 0..LOOKUPS {
                let k = next_rand(&mut rng) % (KEYS * 2);
                if let Some(v) = reader.apply(&k, |_, v| *v) {
                    assert_eq!(v, value_of(k), "value mismatch for key {k}");
                    found += 1;
                }
            }
            found
        }));
    }

    let stop_writer = Arc::clone(&stop);
    let writer = thread::spawn(move || {
        let mut rng = 0xdead_beef_0bad_cafeu64;
        let mut ops = 0usize;
        while !stop_writer.load(Ordering::Relaxed) {
            let k = next_rand(&mut rng) % (KEYS * 2);
            if w.remove(&k).is_none() {
                w.insert(k, value_of(k)).unwrap();
            }
            ops += 1;
        }
        w.reclaim_all();
        ops
    });

    let found: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();
    stop.store(true, Ordering::Relaxed);
    let ops = writer.join().unwrap();

    assert!(ops > 0, "writer made no progress");
    assert!(found > 0, "readers never observed a hit");
}

#[test]
fn for_each_races_inserts() {
    const KEYS: u64 = 5_000;

    let table = SwmrTable::<u64, u64>::new().unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reader_table = table.clone();
    let reader_done = Arc::clone(&done);
    let walker = thread::spawn(move || {
        let reader = reader_table.reader().unwrap();
        let mut max_seen = 0usize;
        while !reader_done.load(Ordering::Relaxed) {
            let mut seen = 0usize;
            reader.for_each(|k, v| {
                assert_eq!(*v, value_of(*k), "iteration saw a torn entry");
                seen += 1;
                true
            });
            max_seen = max_seen.max(seen);
        }
        max_seen
    });

    let mut w = table.writer().unwrap();
    for k in 0..KEYS {
        w.insert(k, value_of(k)).unwrap();
    }
    done.store(true, Ordering::Relaxed);

    let max_seen = walker.join().unwrap();
    assert!(max_seen <= KEYS as usize);

    // A quiescent walk sees everything.
    let reader = table.reader().unwrap();
    let mut seen = 0usize;
    reader.for_each(|_, _| {
        seen += 1;
        true
    });
    assert_eq!(seen, KEYS as usize);
}

#[test]
fn retired_body_stays_pinned_by_a_parked_reader() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    let mut w = table.writer().unwrap();
    for k in 0..100 {
        w.insert(k, value_of(k)).unwrap();
    }

    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let reader_table = table.clone();
    let parked = thread::spawn(move || {
        let reader = reader_table.reader().unwrap();
        let hit = reader.apply(&7, move |_, &v| {
            entered_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            v
        });
        assert_eq!(hit, Some(value_of(7)));
    });

    entered_rx.recv().unwrap();
    // Force at least one rebuild while the reader is parked inside its
    // callback.
    for k in 100..2_000 {
        w.insert(k, value_of(k)).unwrap();
    }
    assert!(table.capacity() > 128, "churn was supposed to rebuild");
    assert!(
        w.pending_reclaim() > 0,
        "old body must stay pinned by the parked reader"
    );
    assert!(w.try_reclaim() > 0, "sweep must not free a pinned body");

    resume_tx.send(()).unwrap();
    parked.join().unwrap();

    assert_eq!(w.try_reclaim(), 0, "released bodies must be reclaimed");
    assert_eq!(w.pending_reclaim(), 0);
}

#[test]
fn writer_latch_serializes_competing_writers() {
    let table = SwmrTable::<u64, u64>::new().unwrap();

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let table = table.clone();
        handles.push(thread::spawn(move || {
            for i in 0..250u64 {
                let mut w = table.writer_blocking();
                w.insert(t * 1_000 + i, value_of(t * 1_000 + i)).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(table.len(), 1_000);
    let r = table.reader().unwrap();
    for t in 0..4u64 {
        for i in 0..250u64 {
            assert!(r.contains(&(t * 1_000 + i)));
        }
    }
}
