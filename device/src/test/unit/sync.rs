use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{CpuTimelineSignal, Error, TimelineSignal};

#[test]
fn test_signal_is_monotonic() {
    let signal = CpuTimelineSignal::new();
    signal.set(5);
    signal.set(3);

    assert_eq!(signal.value(), 5);
    assert!(signal.is_reached(5));
    assert!(!signal.is_reached(6));
}

#[test]
fn test_wait_already_reached() {
    let signal = CpuTimelineSignal::new();
    signal.set(2);
    signal.wait(1, 10).unwrap();
}

#[test]
fn test_wait_timeout() {
    let signal = CpuTimelineSignal::new();
    signal.set(1);

    let err = signal.wait(2, 20).unwrap_err();
    assert!(matches!(err, Error::Timeout { target: 2, current: 1, timeout_ms: 20 }));
}

#[test]
fn test_wait_across_threads() {
    let signal = Arc::new(CpuTimelineSignal::new());
    let producer = Arc::clone(&signal);

    let handle = thread::spawn(move || {
        for value in 1..=10 {
            thread::sleep(Duration::from_millis(1));
            producer.set(value);
        }
    });

    signal.wait(10, 0).unwrap();
    assert_eq!(signal.value(), 10);
    handle.join().unwrap();
}
