//! Launch parameters: a variable struct uploaded to each device per launch.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snafu::OptionExt;
use strix_device::{Device, DeviceBuffer};

use crate::context::ContextInner;
use crate::error::{ContextDroppedSnafu, Result};
use crate::layout::{HasVariables, InstanceVariables, VariableLayout};
use crate::object::{ObjectId, ObjectKind, RegisteredObject};
use crate::registry::DeviceDataRegistry;
use crate::sbt;

#[derive(Debug, Default)]
struct UploadState {
    version: Option<u64>,
    last_use: u64,
}

#[derive(Debug)]
struct LaunchParamsDevice {
    device: Arc<Device>,
    buffer: DeviceBuffer,
    upload: Mutex<UploadState>,
}

#[derive(Debug)]
pub struct LaunchParams {
    id: ObjectId,
    context: Weak<ContextInner>,
    vars: InstanceVariables,
    devices: DeviceDataRegistry<LaunchParamsDevice>,
}

impl LaunchParams {
    pub(crate) fn new(id: ObjectId, context: Weak<ContextInner>, layout: VariableLayout, active: &[bool]) -> Self {
        Self {
            id,
            context,
            vars: InstanceVariables::new(layout),
            devices: DeviceDataRegistry::new(id, ObjectKind::LaunchParams, active),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    /// Parameter buffer on device `ordinal`, if a launch has used it.
    pub fn buffer(&self, ordinal: usize) -> Result<DeviceBuffer> {
        Ok(self.devices.get(ordinal)?.buffer.clone())
    }

    /// Bring the buffer on device `ordinal` up to date with the variables.
    ///
    /// Launches already queued keep reading the previous contents.
    pub(crate) fn upload(&self, ordinal: usize) -> Result<DeviceBuffer> {
        let per_device = self.devices.ensure(ordinal, || {
            let device = self.context()?.device(ordinal)?;
            let buffer = device.allocate(self.vars.layout().struct_size())?;
            Ok(LaunchParamsDevice { device, buffer, upload: Mutex::default() })
        })?;

        let mut upload = per_device.upload.lock();
        let (bytes, version) = self.vars.snapshot();
        if upload.version != Some(version) {
            upload.last_use = sbt::upload(&per_device.device, &per_device.buffer, bytes, upload.last_use)?;
            upload.version = Some(version);
            tracing::trace!(params = %self.id, device = ordinal, version, "launch params uploaded");
        }
        Ok(per_device.buffer.clone())
    }

    pub(crate) fn mark_used(&self, ordinal: usize, seq: u64) {
        if let Ok(per_device) = self.devices.get(ordinal) {
            let mut upload = per_device.upload.lock();
            upload.last_use = upload.last_use.max(seq);
        }
    }

    /// Wait for every launch submitted so far on every active device.
    pub fn sync(&self) -> Result<()> {
        self.context()?.synchronize()
    }
}

impl HasVariables for LaunchParams {
    fn variables(&self) -> &InstanceVariables {
        &self.vars
    }
}

impl RegisteredObject for LaunchParams {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::LaunchParams
    }

    fn grow_devices(&self, slots: usize) {
        self.devices.grow(slots);
    }

    fn retire_device(&self, ordinal: usize) -> Result<()> {
        self.devices.retire(ordinal).map(|_| ())
    }
}

impl Drop for LaunchParams {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}
