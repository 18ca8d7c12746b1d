//! In-order execution queues.
//!
//! Every device owns one [`ExecutionQueue`]: a worker thread that drains a FIFO
//! of [`Work`] items and hands each one to the device backend. Submission
//! never blocks on execution. Completion is tracked with a timeline signal:
//!
//! ```ignore
//! let seq = queue.submit(work)?;   // returns immediately
//! queue.wait_for(seq, 0)?;         // or queue.synchronize()
//! ```
//!
//! Items on the same queue run in submission order. Nothing orders work across
//! queues.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use snafu::ensure;

use crate::buffer::DeviceBuffer;
use crate::device::Backend;
use crate::error::{DeviceUnavailableSnafu, Error, QueueClosedSnafu, Result};
use crate::handle::{KernelHandle, ProgramGroupHandle};
use crate::sync::{CpuTimelineSignal, TimelineSignal};

/// Ray-generation launch over a 2D grid.
#[derive(Debug, Clone)]
pub struct RayGenLaunch {
    pub group: ProgramGroupHandle,
    /// SBT record of the ray-generation object on this device.
    pub record: DeviceBuffer,
    pub dims: [u32; 2],
    pub params: Option<DeviceBuffer>,
}

/// Bounds-kernel launch, one thread per primitive.
#[derive(Debug, Clone)]
pub struct BoundsLaunch {
    pub kernel: KernelHandle,
    /// Instance variables of the geometry, as seen by the kernel.
    pub geom_data: Vec<u8>,
    pub prim_count: usize,
    /// Receives `prim_count` boxes.
    pub output: DeviceBuffer,
}

/// Host-to-device copy ordered after the work already on the queue.
#[derive(Debug, Clone)]
pub struct CopyIn {
    pub dst: DeviceBuffer,
    pub bytes: Vec<u8>,
}

impl CopyIn {
    pub fn apply(&self) -> Result<()> {
        self.dst.copyin(&self.bytes)
    }
}

/// A unit of work submitted to a queue.
#[derive(Debug, Clone)]
pub enum Work {
    RayGen(RayGenLaunch),
    Bounds(BoundsLaunch),
    Copy(CopyIn),
}

impl Work {
    pub fn label(&self) -> &'static str {
        match self {
            Work::RayGen(_) => "raygen",
            Work::Bounds(_) => "bounds",
            Work::Copy(_) => "copy",
        }
    }
}

/// Failed items kept for [`ExecutionQueue::wait_item`]; the oldest are dropped beyond this.
const RETAINED_FAILURES: usize = 256;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<(u64, Work)>,
    /// Sequence number of the last submitted item.
    submitted: u64,
    closed: bool,
    /// First execution error since the last synchronization.
    failure: Option<Error>,
    /// Errors of failed items not yet claimed through `wait_item`.
    failed: BTreeMap<u64, Error>,
}

#[derive(Debug)]
struct QueueShared {
    device: usize,
    backend: Arc<dyn Backend>,
    state: Mutex<QueueState>,
    available: Condvar,
    completed: CpuTimelineSignal,
}

impl QueueShared {
    fn run(&self) {
        loop {
            let (seq, work) = {
                let mut state = self.state.lock();
                loop {
                    if let Some(item) = state.pending.pop_front() {
                        break item;
                    }
                    if state.closed {
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };

            if let Err(error) = self.backend.execute(&work) {
                tracing::warn!(device = self.device, seq, work = work.label(), %error, "queued work failed");
                let mut state = self.state.lock();
                state.failure.get_or_insert_with(|| error.clone());
                state.failed.insert(seq, error);
                if state.failed.len() > RETAINED_FAILURES {
                    state.failed.pop_first();
                }
            }
            // Release buffer references before waiters observe completion.
            drop(work);
            self.completed.set(seq);
        }
    }
}

/// FIFO execution queue backed by a dedicated worker thread.
#[derive(Debug)]
pub struct ExecutionQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl ExecutionQueue {
    pub fn new(device: usize, backend: Arc<dyn Backend>) -> Result<Self> {
        let shared = Arc::new(QueueShared {
            device,
            backend,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            completed: CpuTimelineSignal::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("strix-queue-{device}"))
            .spawn(move || worker_shared.run())
            .map_err(|e| DeviceUnavailableSnafu { index: device, reason: e.to_string() }.build())?;

        Ok(Self { shared, worker: Some(worker) })
    }

    pub fn device(&self) -> usize {
        self.shared.device
    }

    /// Enqueue `work` and return its sequence number without waiting for it.
    pub fn submit(&self, work: Work) -> Result<u64> {
        let mut state = self.shared.state.lock();
        ensure!(!state.closed, QueueClosedSnafu { device: self.shared.device });

        state.submitted += 1;
        let seq = state.submitted;
        tracing::trace!(device = self.shared.device, seq, work = work.label(), "work submitted");
        state.pending.push_back((seq, work));
        self.shared.available.notify_one();
        Ok(seq)
    }

    /// Sequence number of the last submitted item (0 if none).
    pub fn submitted(&self) -> u64 {
        self.shared.state.lock().submitted
    }

    /// Sequence number of the last completed item.
    pub fn completed(&self) -> u64 {
        self.shared.completed.value()
    }

    /// Block until item `seq` has run. `timeout_ms == 0` waits forever.
    pub fn wait_for(&self, seq: u64, timeout_ms: u64) -> Result<()> {
        self.shared.completed.wait(seq, timeout_ms)
    }

    /// Block until item `seq` has run and report whether that item failed.
    ///
    /// Unlike [`ExecutionQueue::synchronize`], failures of other items are left
    /// alone. The item's own failure is reported here even if a synchronization
    /// already returned it.
    pub fn wait_item(&self, seq: u64) -> Result<()> {
        self.wait_for(seq, 0)?;
        match self.shared.state.lock().failed.remove(&seq) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Block until everything submitted so far has run, then report the first
    /// execution failure since the previous synchronization.
    pub fn synchronize(&self) -> Result<()> {
        let target = self.submitted();
        self.wait_for(target, 0)?;
        match self.shared.state.lock().failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!(device = self.shared.device, "queue worker panicked");
        }
    }
}
