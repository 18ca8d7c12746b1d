//! Device abstraction.
//!
//! A [`Device`] is one accelerator participating in a context. It bundles:
//! - **Backend**: compiles modules, builds program groups, packs SBT headers and executes work
//! - **Allocator**: manages device memory for buffers
//! - **Queue**: the in-order execution queue work is submitted to
//!
//! Backends are opaque services; the runtime never looks behind a handle.

use std::sync::Arc;

use crate::allocator::{Allocator, BufferOptions};
use crate::buffer::DeviceBuffer;
use crate::error::Result;
use crate::handle::{KernelHandle, ModuleHandle, ProgramGroupHandle};
use crate::options::CompileOptions;
use crate::queue::{ExecutionQueue, Work};

/// Size of the backend-defined header that starts every SBT record.
pub const SBT_RECORD_HEADER_SIZE: usize = 32;

/// Packed SBT record header identifying a program group on one device.
pub type SbtHeader = [u8; SBT_RECORD_HEADER_SIZE];

/// Reference to an entry point inside a compiled module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub module: ModuleHandle,
    pub symbol: String,
}

impl EntryPoint {
    pub fn new(module: ModuleHandle, symbol: impl Into<String>) -> Self {
        Self { module, symbol: symbol.into() }
    }
}

/// Description of a pipeline program group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgramGroupDesc {
    RayGen(EntryPoint),
    HitGroup { closest_hit: Option<EntryPoint>, any_hit: Option<EntryPoint>, intersection: Option<EntryPoint> },
}

/// Compilation, program-group and execution services of one physical device.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Compile a source blob. Failures carry the compiler log.
    fn compile(&self, source: &[u8], options: &CompileOptions) -> Result<ModuleHandle>;

    fn destroy_module(&self, module: ModuleHandle) -> Result<()>;

    fn create_program_group(&self, desc: &ProgramGroupDesc) -> Result<ProgramGroupHandle>;

    fn destroy_program_group(&self, group: ProgramGroupHandle) -> Result<()>;

    /// Look up a directly launchable kernel. Kernels live as long as their module.
    fn load_kernel(&self, entry: &EntryPoint) -> Result<KernelHandle>;

    /// Header bytes that make an SBT record dispatch to `group`.
    fn pack_header(&self, group: ProgramGroupHandle) -> Result<SbtHeader>;

    /// Run one unit of work to completion. Called from the device's queue worker.
    fn execute(&self, work: &Work) -> Result<()>;

    fn name(&self) -> &str;
}

/// Static description of a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index of the device on its platform.
    pub index: usize,
    pub name: String,
    /// Whether the device has ray-tracing cores.
    pub rtx: bool,
    pub memory_bytes: usize,
}

/// Backend and allocator of a freshly opened physical device.
#[derive(Debug, Clone)]
pub struct OpenedDevice {
    pub backend: Arc<dyn Backend>,
    pub allocator: Arc<dyn Allocator>,
}

/// Enumerates and opens physical devices.
pub trait Platform: Send + Sync + std::fmt::Debug {
    fn device_count(&self) -> usize;

    fn info(&self, index: usize) -> Result<DeviceInfo>;

    fn open(&self, index: usize) -> Result<OpenedDevice>;
}

/// One device of a context.
///
/// The ordinal is the device's slot in its context; it is assigned once and
/// never reused, even after the device is removed.
#[derive(Debug)]
pub struct Device {
    ordinal: usize,
    info: DeviceInfo,
    backend: Arc<dyn Backend>,
    allocator: Arc<dyn Allocator>,
    queue: ExecutionQueue,
}

impl Device {
    pub fn new(ordinal: usize, info: DeviceInfo, opened: OpenedDevice) -> Result<Self> {
        let queue = ExecutionQueue::new(ordinal, Arc::clone(&opened.backend))?;
        Ok(Self { ordinal, info, backend: opened.backend, allocator: opened.allocator, queue })
    }

    /// Open physical device `index` from `platform` as context slot `ordinal`.
    pub fn open(platform: &dyn Platform, index: usize, ordinal: usize) -> Result<Self> {
        let info = platform.info(index)?;
        let opened = platform.open(index)?;
        Self::new(ordinal, info, opened)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn allocate(&self, size: usize) -> Result<DeviceBuffer> {
        DeviceBuffer::allocate(Arc::clone(&self.allocator), size, BufferOptions { zero_init: true })
    }

    /// Wait for everything submitted to this device so far.
    pub fn synchronize(&self) -> Result<()> {
        self.queue.synchronize()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (ordinal {}, {})", self.info.name, self.ordinal, self.backend.name())
    }
}
