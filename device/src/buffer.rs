use std::mem::ManuallyDrop;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{Result, SizeMismatchSnafu};

/// Allocation shared by every clone of a [`DeviceBuffer`].
#[derive(Debug)]
struct BufferData {
    raw: ManuallyDrop<Mutex<RawBuffer>>,
    allocator: Arc<dyn Allocator>,
    size: usize,
}

impl Drop for BufferData {
    fn drop(&mut self) {
        // SAFETY: `raw` is never touched again after this point.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.allocator.free(raw.into_inner());
    }
}

/// Fixed-size device allocation.
///
/// The size is chosen at allocation and never changes. Clones share the same
/// memory, which is handed back to the allocator when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    data: Arc<BufferData>,
}

impl DeviceBuffer {
    pub fn allocate(allocator: Arc<dyn Allocator>, size: usize, options: BufferOptions) -> Result<Self> {
        let raw = allocator.alloc(size, &options)?;
        Ok(Self { data: Arc::new(BufferData { raw: ManuallyDrop::new(Mutex::new(raw)), allocator, size }) })
    }

    pub fn size(&self) -> usize {
        self.data.size
    }

    /// Replace the whole buffer contents. `src` must be exactly [`DeviceBuffer::size`] bytes.
    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        let expected = self.size();
        let actual = src.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        self.data.raw.lock().bytes_mut().copy_from_slice(src);
        Ok(())
    }

    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let expected = self.size();
        let actual = dst.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        dst.copy_from_slice(self.data.raw.lock().bytes());
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.raw.lock().bytes().to_vec()
    }

    /// Address that device programs use to reach this buffer.
    pub fn device_address(&self) -> u64 {
        self.data.raw.lock().bytes().as_ptr() as u64
    }

    /// Whether two handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
