//! Shader-binding-table records.
//!
//! A record is a backend header naming a program group followed by exactly the
//! owning object's variable bytes. Objects with one record per ray type keep
//! them back to back in a single buffer.

use parking_lot::Mutex;
use smallvec::SmallVec;
use snafu::ensure;
use strix_device::{CopyIn, Device, DeviceBuffer, ProgramGroupHandle, SBT_RECORD_HEADER_SIZE, SbtHeader, Work};

use crate::error::{RecordSizeMismatchSnafu, Result};

pub type GroupList = SmallVec<[ProgramGroupHandle; 2]>;

/// What a record was last written from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStamp {
    pub vars_version: u64,
    pub groups: GroupList,
}

#[derive(Debug, Default)]
struct RecordState {
    stamp: Option<RecordStamp>,
    /// Queue sequence of the last launch that reads this record.
    last_use: u64,
}

/// Fixed-size record buffer on one device.
#[derive(Debug)]
pub(crate) struct SbtRecord {
    buffer: DeviceBuffer,
    payload_size: usize,
    count: usize,
    state: Mutex<RecordState>,
}

impl SbtRecord {
    /// Bytes of one record carrying `payload_size` bytes of variables.
    pub const fn record_size(payload_size: usize) -> usize {
        SBT_RECORD_HEADER_SIZE + payload_size
    }

    pub fn allocate(device: &Device, payload_size: usize, count: usize) -> Result<Self> {
        let buffer = device.allocate(Self::record_size(payload_size) * count)?;
        Ok(Self { buffer, payload_size, count, state: Mutex::default() })
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn is_current(&self, stamp: &RecordStamp) -> bool {
        self.state.lock().stamp.as_ref() == Some(stamp)
    }

    /// Remember that queue item `seq` reads this record.
    pub fn mark_used(&self, seq: u64) {
        let mut state = self.state.lock();
        state.last_use = state.last_use.max(seq);
    }

    /// Write one record per header, each followed by `payload`.
    ///
    /// The records are staged on the host and uploaded in one copy, so the
    /// buffer is either fully rewritten or untouched. Returns `false` when the
    /// buffer already holds `stamp`. Never waits for the device: see [`upload`].
    pub fn write(&self, device: &Device, headers: &[SbtHeader], payload: &[u8], stamp: RecordStamp) -> Result<bool> {
        let mut state = self.state.lock();
        if state.stamp.as_ref() == Some(&stamp) {
            return Ok(false);
        }

        ensure!(headers.len() == self.count, RecordSizeMismatchSnafu { expected: self.count, actual: headers.len() });
        ensure!(
            payload.len() == self.payload_size,
            RecordSizeMismatchSnafu { expected: self.payload_size, actual: payload.len() }
        );

        let mut staging = Vec::with_capacity(self.buffer.size());
        for header in headers {
            staging.extend_from_slice(header);
            staging.extend_from_slice(payload);
        }
        ensure!(
            staging.len() == self.buffer.size(),
            RecordSizeMismatchSnafu { expected: self.buffer.size(), actual: staging.len() }
        );

        state.last_use = upload(device, &self.buffer, staging, state.last_use)?;
        state.stamp = Some(stamp);
        Ok(true)
    }
}

/// Replace the contents of `buffer` with `bytes`.
///
/// `last_use` is the last queue item that touches the buffer. While it has not
/// run, the copy is queued behind it instead of being done in place, so earlier
/// launches see the old bytes and later ones the new. Returns the new last item
/// touching the buffer.
pub(crate) fn upload(device: &Device, buffer: &DeviceBuffer, bytes: Vec<u8>, last_use: u64) -> Result<u64> {
    let queue = device.queue();
    if last_use <= queue.completed() {
        buffer.copyin(&bytes)?;
        return Ok(last_use);
    }

    let seq = queue.submit(Work::Copy(CopyIn { dst: buffer.clone(), bytes }))?;
    tracing::trace!(device = device.ordinal(), seq, after = last_use, "upload queued behind in-flight reader");
    Ok(seq)
}
