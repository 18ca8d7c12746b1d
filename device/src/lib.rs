//! Device layer of strix.
//!
//! Everything the object model needs from an accelerator, behind traits:
//! [`Backend`] (compilation, program groups, SBT headers, execution),
//! [`Allocator`] (device memory) and [`Platform`] (device discovery). A
//! [`Device`] bundles one opened backend with its allocator and an in-order
//! [`ExecutionQueue`].
//!
//! The [`host`] module provides an emulated platform used by tests and by
//! anyone who wants to drive the model without a GPU driver.

pub mod allocator;
pub mod buffer;
pub mod device;
pub mod error;
pub mod geometry;
pub mod handle;
pub mod host;
pub mod options;
pub mod queue;
pub mod sync;


pub use allocator::{Allocator, BufferOptions, HostAllocator, RawBuffer};
pub use buffer::DeviceBuffer;
pub use device::{
    Backend, Device, DeviceInfo, EntryPoint, OpenedDevice, Platform, ProgramGroupDesc, SBT_RECORD_HEADER_SIZE,
    SbtHeader,
};
pub use error::{Error, Result};
pub use geometry::Aabb;
pub use handle::{KernelHandle, ModuleHandle, ProgramGroupHandle};
pub use options::{CompileOptions, DebugLevel, OptLevel};
pub use queue::{BoundsLaunch, CopyIn, ExecutionQueue, RayGenLaunch, Work};
pub use sync::{CpuTimelineSignal, TimelineSignal};
