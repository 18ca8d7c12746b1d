use std::sync::Arc;

use crate::{Allocator, BufferOptions, DeviceBuffer, Error, HostAllocator};

fn allocate(allocator: &Arc<HostAllocator>, size: usize) -> crate::Result<DeviceBuffer> {
    DeviceBuffer::allocate(Arc::clone(allocator) as Arc<dyn Allocator>, size, BufferOptions { zero_init: true })
}

#[test]
fn test_allocation_is_zeroed() {
    let allocator = Arc::new(HostAllocator::new(0, None));
    let buffer = allocate(&allocator, 64).unwrap();

    assert_eq!(buffer.size(), 64);
    assert!(buffer.to_vec().iter().all(|b| *b == 0));
    assert_eq!(allocator.bytes_in_use(), 64);
}

#[test]
fn test_copyin_copyout() {
    let allocator = Arc::new(HostAllocator::new(0, None));
    let buffer = allocate(&allocator, 4).unwrap();

    buffer.copyin(&[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 4];
    buffer.copyout(&mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

#[test]
fn test_copyin_size_mismatch_leaves_contents() {
    let allocator = Arc::new(HostAllocator::new(0, None));
    let buffer = allocate(&allocator, 4).unwrap();
    buffer.copyin(&[9; 4]).unwrap();

    let err = buffer.copyin(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected: 4, actual: 3 }));
    assert_eq!(buffer.to_vec(), vec![9; 4]);
}

#[test]
fn test_clones_share_allocation() {
    let allocator = Arc::new(HostAllocator::new(0, None));
    let buffer = allocate(&allocator, 8).unwrap();
    let clone = buffer.clone();

    clone.copyin(&[7; 8]).unwrap();
    assert_eq!(buffer.to_vec(), vec![7; 8]);
    assert!(buffer.same_allocation(&clone));
    assert_eq!(buffer.device_address(), clone.device_address());

    let other = allocate(&allocator, 8).unwrap();
    assert!(!buffer.same_allocation(&other));
}

#[test]
fn test_last_clone_frees() {
    let allocator = Arc::new(HostAllocator::new(0, None));
    let buffer = allocate(&allocator, 16).unwrap();
    let clone = buffer.clone();
    assert_eq!(allocator.live_buffers(), 1);

    drop(buffer);
    assert_eq!(allocator.live_buffers(), 1);
    drop(clone);
    assert_eq!(allocator.live_buffers(), 0);
    assert_eq!(allocator.bytes_in_use(), 0);
}

#[test]
fn test_budget_exhausted() {
    let allocator = Arc::new(HostAllocator::new(3, Some(100)));
    let _kept = allocate(&allocator, 60).unwrap();

    let err = allocate(&allocator, 50).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { device: 3, requested: 50, available: 40 }));
    assert_eq!(allocator.bytes_in_use(), 60);
    assert_eq!(allocator.live_buffers(), 1);

    allocate(&allocator, 40).unwrap();
}

#[test]
fn test_allocator_name() {
    assert_eq!(HostAllocator::new(2, None).name(), "HOST:2");
}
