//! In-process reference backend.
//!
//! Emulates a set of GPUs on the CPU so the object model can run without a
//! driver. Each emulated device gets its own [`HostBackend`] and
//! [`HostAllocator`]; ray-generation and bounds programs are Rust closures
//! registered in [`HostPrograms`] under their entry symbol.

mod backend;
mod programs;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use snafu::ensure;

use crate::allocator::HostAllocator;
use crate::device::{DeviceInfo, OpenedDevice, Platform};
use crate::error::{DeviceUnavailableSnafu, Result};

pub use backend::{HOST_HEADER_MAGIC, HostBackend, HostStats};
pub use programs::{BoundsFn, BoundsInvocation, HostPrograms, RayGenFn, RayGenInvocation};

/// Memory reported for devices without a budget.
pub const DEFAULT_HOST_MEMORY: usize = 1 << 30;

/// Shape of an emulated platform.
#[derive(Debug, Clone, bon::Builder)]
pub struct HostPlatformConfig {
    #[builder(default = 1)]
    pub device_count: usize,
    /// Devices whose `open` fails.
    #[builder(default)]
    pub unavailable: Vec<usize>,
    /// Devices whose compiler rejects every module.
    #[builder(default)]
    pub failing_compilers: Vec<usize>,
    /// Devices reported without ray-tracing cores.
    #[builder(default)]
    pub without_rtx: Vec<usize>,
    /// Per-device allocation budget in bytes. Unlimited when absent.
    pub memory_budget: Option<usize>,
}

impl Default for HostPlatformConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
struct OpenedHost {
    index: usize,
    backend: Arc<HostBackend>,
    allocator: Arc<HostAllocator>,
}

/// Platform of emulated devices.
#[derive(Debug)]
pub struct HostPlatform {
    config: HostPlatformConfig,
    programs: Arc<HostPrograms>,
    next_handle: Arc<AtomicU64>,
    opened: Mutex<Vec<OpenedHost>>,
}

impl HostPlatform {
    pub fn new(config: HostPlatformConfig) -> Self {
        Self {
            config,
            programs: Arc::new(HostPrograms::new()),
            next_handle: Arc::new(AtomicU64::new(1)),
            opened: Mutex::default(),
        }
    }

    /// Platform with `count` healthy devices.
    pub fn with_devices(count: usize) -> Self {
        Self::new(HostPlatformConfig::builder().device_count(count).build())
    }

    pub fn config(&self) -> &HostPlatformConfig {
        &self.config
    }

    pub fn programs(&self) -> &HostPrograms {
        &self.programs
    }

    /// Backend of the most recent `open` of device `index`.
    pub fn backend(&self, index: usize) -> Option<Arc<HostBackend>> {
        self.opened.lock().iter().rev().find(|o| o.index == index).map(|o| Arc::clone(&o.backend))
    }

    /// Allocator of the most recent `open` of device `index`.
    pub fn allocator(&self, index: usize) -> Option<Arc<HostAllocator>> {
        self.opened.lock().iter().rev().find(|o| o.index == index).map(|o| Arc::clone(&o.allocator))
    }
}

impl Platform for HostPlatform {
    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn info(&self, index: usize) -> Result<DeviceInfo> {
        ensure!(
            index < self.config.device_count,
            DeviceUnavailableSnafu { index, reason: format!("platform has {} devices", self.config.device_count) }
        );
        Ok(DeviceInfo {
            index,
            name: format!("host device {index}"),
            rtx: !self.config.without_rtx.contains(&index),
            memory_bytes: self.config.memory_budget.unwrap_or(DEFAULT_HOST_MEMORY),
        })
    }

    fn open(&self, index: usize) -> Result<OpenedDevice> {
        self.info(index)?;
        ensure!(
            !self.config.unavailable.contains(&index),
            DeviceUnavailableSnafu { index, reason: "device failed to initialize" }
        );

        let backend = Arc::new(HostBackend::new(
            index,
            self.config.failing_compilers.contains(&index),
            Arc::clone(&self.programs),
            Arc::clone(&self.next_handle),
        ));
        let allocator = Arc::new(HostAllocator::new(index, self.config.memory_budget));
        tracing::debug!(device = index, "host device opened");

        self.opened.lock().push(OpenedHost {
            index,
            backend: Arc::clone(&backend),
            allocator: Arc::clone(&allocator),
        });
        Ok(OpenedDevice { backend, allocator })
    }
}
