use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::{DeviceDataRegistry, Error, ObjectId, ObjectKind};

fn registry(active: &[bool]) -> DeviceDataRegistry<String> {
    DeviceDataRegistry::new(ObjectId::next(), ObjectKind::RayGen, active)
}

#[test]
fn test_get_after_ensure_returns_same_state() {
    let registry = registry(&[true, true]);
    let created = registry.ensure(1, || Ok("state".to_string())).unwrap();

    let first = registry.get(1).unwrap();
    let second = registry.get(1).unwrap();
    assert!(Arc::ptr_eq(&created, &first));
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_ensure_runs_factory_once() {
    let registry = registry(&[true]);
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        registry
            .ensure(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("state".to_string())
            })
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_out_of_range() {
    let registry = registry(&[true, true]);

    let err = registry.get(2).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { what: "device", index: 2, count: 2 }));
    assert!(matches!(registry.ensure(7, || Ok(String::new())), Err(Error::OutOfRange { index: 7, .. })));
}

#[test]
fn test_vacant_slot_is_missing() {
    let registry = registry(&[true]);
    assert!(matches!(registry.get(0), Err(Error::DeviceDataMissing { ordinal: 0, .. })));
}

#[test]
fn test_failing_factory_leaves_slot_vacant() {
    let registry = registry(&[true]);
    let err = registry
        .ensure(0, || Err(Error::Compilation { device: 0, log: "bad".into() }))
        .unwrap_err();

    assert!(matches!(err, Error::Compilation { .. }));
    assert!(!registry.is_materialized(0));
    registry.ensure(0, || Ok("second try".to_string())).unwrap();
    assert_eq!(registry.get(0).unwrap().as_str(), "second try");
}

#[test]
fn test_retire_tombstones_without_compacting() {
    let registry = registry(&[true, true, true]);
    registry.ensure(0, || Ok("a".to_string())).unwrap();
    registry.ensure(1, || Ok("b".to_string())).unwrap();
    registry.ensure(2, || Ok("c".to_string())).unwrap();

    assert!(registry.retire(1).unwrap());
    assert_eq!(registry.slot_count(), 3);
    assert!(matches!(registry.get(1), Err(Error::DeviceRetired { ordinal: 1 })));
    assert!(matches!(registry.ensure(1, || Ok("again".to_string())), Err(Error::DeviceRetired { .. })));
    assert_eq!(registry.get(2).unwrap().as_str(), "c");
    assert_eq!(registry.materialized(), vec![0, 2]);
    assert!(!registry.retire(1).unwrap());
}

#[test]
fn test_retire_past_the_end_is_rejected() {
    let registry = registry(&[true, true]);
    registry.ensure(0, || Ok("a".to_string())).unwrap();

    assert!(matches!(registry.retire(5), Err(Error::OutOfRange { what: "device", index: 5, count: 2 })));
    assert_eq!(registry.slot_count(), 2);
    assert!(!registry.is_retired(5));
    assert_eq!(registry.materialized(), vec![0]);
}

#[test]
fn test_inactive_slots_start_retired() {
    let registry = registry(&[true, false]);
    assert!(registry.is_retired(1));
    assert!(matches!(registry.get(1), Err(Error::DeviceRetired { ordinal: 1 })));
}

#[test]
fn test_grow_adds_vacant_slots() {
    let registry = registry(&[true]);
    registry.grow(3);
    registry.grow(2);

    assert_eq!(registry.slot_count(), 3);
    registry.ensure(2, || Ok("new device".to_string())).unwrap();
    assert_eq!(registry.materialized(), vec![2]);
}

#[test]
fn test_ensure_fresh_replaces_stale_state() {
    let registry = registry(&[true]);
    let old = registry.ensure(0, || Ok("v1".to_string())).unwrap();

    let same = registry.ensure_fresh(0, |state| state == "v1", || Ok("v2".to_string())).unwrap();
    assert!(Arc::ptr_eq(&old, &same));

    let new = registry.ensure_fresh(0, |state| state == "v2", || Ok("v2".to_string())).unwrap();
    assert_eq!(new.as_str(), "v2");
    assert!(!Arc::ptr_eq(&old, &new));
}

#[test]
fn test_invalidate() {
    let registry = registry(&[true, false]);
    registry.ensure(0, || Ok("state".to_string())).unwrap();

    assert_eq!(registry.invalidate(0).unwrap().as_deref().map(String::as_str), Some("state"));
    assert!(registry.invalidate(0).unwrap().is_none());
    assert!(matches!(registry.invalidate(1), Err(Error::DeviceRetired { .. })));
    assert!(registry.is_retired(1));
}

#[test]
fn test_concurrent_first_touch_runs_factory_once() {
    const THREADS: usize = 8;
    let registry = Arc::new(registry(&[true, true]));
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (registry, calls, barrier) = (Arc::clone(&registry), Arc::clone(&calls), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                registry
                    .ensure(1, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(5));
                        Ok("shared".to_string())
                    })
                    .unwrap()
            })
        })
        .collect();

    let states: Vec<Arc<String>> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(states.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[test]
fn test_different_slots_do_not_block() {
    let registry = Arc::new(registry(&[true, true]));
    let inner = Arc::clone(&registry);

    // Touching slot 1 from inside slot 0's factory must not deadlock.
    registry
        .ensure(0, || {
            let other = thread::spawn(move || inner.ensure(1, || Ok("one".to_string())).map(|_| ()));
            other.join().unwrap()?;
            Ok("zero".to_string())
        })
        .unwrap();
    assert_eq!(registry.materialized(), vec![0, 1]);
}
