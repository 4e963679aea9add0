//! Boundary scenarios: fresh tables, growth past the initial capacity,
//! tombstone churn, and shrinking after mass removal.

use rand::seq::SliceRandom;
use rand::thread_rng;
use swmr_table::SwmrTable;

#[test]
fn fresh_table_behaves() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    assert_eq!(table.capacity(), 128);
    assert_eq!(table.len(), 0);
    assert!(table.is_empty());

    let mut w = table.writer().unwrap();
    assert!(w.remove(&12345).is_none());

    let r = table.reader().unwrap();
    assert_eq!(r.apply(&12345, |_, v| *v), None);
    assert!(!r.contains(&0));
}

#[test]
fn grows_past_the_initial_capacity() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    let mut w = table.writer().unwrap();
    for k in 0..200u64 {
        w.insert(k, k * 3).unwrap();
    }

    assert!(table.capacity() >= 256, "capacity: {}", table.capacity());
    assert!(table.capacity().is_power_of_two());
    assert_eq!(table.len(), 200);

    let r = table.reader().unwrap();
    for k in 0..200u64 {
        assert_eq!(r.apply(&k, |_, v| *v), Some(k * 3), "lost key {k}");
    }
}

#[test]
fn tombstone_churn_keeps_the_table_usable() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    let mut w = table.writer().unwrap();

    for k in 0..64u64 {
        w.insert(k, k).unwrap();
    }
    for k in 0..64u64 {
        assert!(w.remove(&k).is_some());
    }
    assert_eq!(table.len(), 0);

    for k in 1_000..1_064u64 {
        w.insert(k, k + 1).unwrap();
    }
    assert_eq!(table.len(), 64);
    // Tombstones are cleared by rehashing, not by unbounded growth.
    assert!(table.capacity() <= 512, "capacity: {}", table.capacity());

    let r = table.reader().unwrap();
    for k in 0..64u64 {
        assert!(!r.contains(&k), "removed key {k} resurfaced");
    }
    for k in 1_000..1_064u64 {
        assert_eq!(r.apply(&k, |_, v| *v), Some(k + 1));
    }
}

#[test]
fn shrinks_after_mass_removal() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    let mut w = table.writer().unwrap();

    let mut keys: Vec<u64> = (0..10_000).collect();
    keys.shuffle(&mut thread_rng());
    for &k in &keys {
        w.insert(k, k).unwrap();
    }
    assert!(table.capacity() >= 16_384, "capacity: {}", table.capacity());

    for k in 500..10_000u64 {
        assert!(w.remove(&k).is_some());
    }
    assert_eq!(table.len(), 500);

    let before = table.capacity();
    w.try_reclaim();
    assert!(w.maybe_shrink().unwrap());
    assert!(table.capacity() <= before / 2);
    assert!(table.capacity().is_power_of_two());

    let r = table.reader().unwrap();
    for k in 0..500u64 {
        assert_eq!(r.apply(&k, |_, v| *v), Some(k), "lost key {k} in shrink");
    }
    for k in 500..10_000u64 {
        assert!(!r.contains(&k));
    }
}

#[test]
fn shrink_refuses_when_occupancy_is_high() {
    let table = SwmrTable::<u64, u64>::new().unwrap();
    let mut w = table.writer().unwrap();
    for k in 0..100u64 {
        w.insert(k, k).unwrap();
    }
    let capacity = table.capacity();
    // 100 live entries in a table of 128+ is nowhere near the shrink
    // threshold.
    assert!(!w.maybe_shrink().unwrap());
    assert_eq!(table.capacity(), capacity);
}
