use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ResourceExhaustedSnafu, Result};

/// Opaque handle to device memory.
#[derive(Debug)]
pub enum RawBuffer {
    /// Memory owned by the host backend.
    Host { data: Box<[u8]> },
}

impl RawBuffer {
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Host { data } => data.len(),
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            RawBuffer::Host { data } => data,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            RawBuffer::Host { data } => data,
        }
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;

    fn free(&self, _buffer: RawBuffer) {}

    fn name(&self) -> &str;
}

/// Host-memory allocator with an optional byte budget.
///
/// Backs the emulated devices of the host backend. Allocations beyond the
/// budget fail with `ResourceExhausted` instead of growing the process.
#[derive(Debug)]
pub struct HostAllocator {
    device: usize,
    budget: Option<usize>,
    in_use: AtomicUsize,
    live: AtomicUsize,
    name: String,
}

impl HostAllocator {
    pub fn new(device: usize, budget: Option<usize>) -> Self {
        Self {
            device,
            budget,
            in_use: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            name: format!("HOST:{device}"),
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let Some(budget) = self.budget else {
            self.in_use.fetch_add(size, Ordering::AcqRel);
            return Ok(());
        };

        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|used| {
                ResourceExhaustedSnafu { device: self.device, requested: size, available: budget.saturating_sub(used) }
                    .build()
            })
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        self.reserve(size)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        // Host memory is always zeroed; `zero_init` only matters to real devices.
        Ok(RawBuffer::Host { data: vec![0u8; size].into_boxed_slice() })
    }

    fn free(&self, buffer: RawBuffer) {
        self.in_use.fetch_sub(buffer.size(), Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
