//! Compiled-module lifecycle.
//!
//! A [`Module`] owns one source blob and, per device, an optional compiled
//! handle. The per-device state machine is `Uncompiled -> Compiled ->
//! Uncompiled -> ...`; every transition happens under that device's own mutex,
//! so different modules and different devices never wait on each other.
//!
//! Each successful compile bumps the device's *generation*. Program groups
//! remember the generation they were built from and are rebuilt once it moves.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snafu::OptionExt;
use strix_device::{CompileOptions, Device, ModuleHandle};

use crate::context::ContextInner;
use crate::error::{ContextDroppedSnafu, Error, Result};
use crate::object::{ObjectId, ObjectKind, RegisteredObject};
use crate::registry::DeviceDataRegistry;

/// A compiled handle together with the generation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledModule {
    pub handle: ModuleHandle,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct CompiledState {
    handle: Option<ModuleHandle>,
    generation: u64,
}

#[derive(Debug)]
struct ModuleDevice {
    device: Arc<Device>,
    state: Mutex<CompiledState>,
}

impl ModuleDevice {
    fn destroy(&self, state: &mut CompiledState) -> Result<()> {
        if let Some(handle) = state.handle.take() {
            self.device.backend().destroy_module(handle)?;
            tracing::debug!(device = self.device.ordinal(), %handle, "module destroyed");
        }
        Ok(())
    }

    fn compile(&self, state: &mut CompiledState, source: &[u8], options: &CompileOptions) -> Result<CompiledModule> {
        let handle = self.device.backend().compile(source, options).inspect_err(|error| {
            tracing::debug!(device = self.device.ordinal(), %error, "module compilation failed");
        })?;
        state.handle = Some(handle);
        state.generation += 1;
        tracing::debug!(device = self.device.ordinal(), %handle, generation = state.generation, "module compiled");
        Ok(CompiledModule { handle, generation: state.generation })
    }
}

impl Drop for ModuleDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take()
            && let Err(error) = self.device.backend().destroy_module(handle)
        {
            tracing::warn!(device = self.device.ordinal(), %handle, %error, "failed to destroy module");
        }
    }
}

/// A program source compiled lazily on each device of a context.
#[derive(Debug)]
pub struct Module {
    id: ObjectId,
    context: Weak<ContextInner>,
    source: Vec<u8>,
    devices: DeviceDataRegistry<ModuleDevice>,
}

impl Module {
    pub(crate) fn new(id: ObjectId, context: Weak<ContextInner>, source: Vec<u8>, active: &[bool]) -> Self {
        Self { id, context, source, devices: DeviceDataRegistry::new(id, ObjectKind::Module, active) }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    fn per_device(&self, ordinal: usize) -> Result<Arc<ModuleDevice>> {
        self.devices.ensure(ordinal, || {
            let device = self.context()?.device(ordinal)?;
            Ok(ModuleDevice { device, state: Mutex::default() })
        })
    }

    /// Compile on device `ordinal`, destroying any previous handle first.
    ///
    /// On failure the module is left uncompiled on that device.
    #[tracing::instrument(skip_all, fields(module = %self.id, device = ordinal))]
    pub fn create(&self, ordinal: usize) -> Result<CompiledModule> {
        let options = self.context()?.compile_options();
        let per_device = self.per_device(ordinal)?;
        let mut state = per_device.state.lock();
        per_device.destroy(&mut state)?;
        per_device.compile(&mut state, &self.source, &options)
    }

    /// Compiled handle on device `ordinal`, compiling only if there is none.
    pub fn ensure_created(&self, ordinal: usize) -> Result<CompiledModule> {
        let per_device = self.per_device(ordinal)?;
        let mut state = per_device.state.lock();
        if let Some(handle) = state.handle {
            return Ok(CompiledModule { handle, generation: state.generation });
        }

        let options = self.context()?.compile_options();
        per_device.compile(&mut state, &self.source, &options)
    }

    /// Release the compiled handle on device `ordinal` if there is one. Repeating is a no-op.
    pub fn destroy_if_created(&self, ordinal: usize) -> Result<()> {
        match self.devices.get(ordinal) {
            Ok(per_device) => {
                let mut state = per_device.state.lock();
                per_device.destroy(&mut state)
            }
            Err(Error::DeviceDataMissing { .. } | Error::DeviceRetired { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Current compiled handle on device `ordinal`.
    pub fn compiled(&self, ordinal: usize) -> Option<CompiledModule> {
        let per_device = self.devices.get(ordinal).ok()?;
        let state = per_device.state.lock();
        state.handle.map(|handle| CompiledModule { handle, generation: state.generation })
    }

    pub fn is_created(&self, ordinal: usize) -> bool {
        self.compiled(ordinal).is_some()
    }

    /// Whether `generation` is still the compiled generation on device `ordinal`.
    pub(crate) fn is_current(&self, ordinal: usize, generation: u64) -> bool {
        self.compiled(ordinal).is_some_and(|compiled| compiled.generation == generation)
    }
}

impl RegisteredObject for Module {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Module
    }

    fn grow_devices(&self, slots: usize) {
        self.devices.grow(slots);
    }

    fn retire_device(&self, ordinal: usize) -> Result<()> {
        self.devices.retire(ordinal).map(|_| ())
    }

    fn rebuild_programs(&self, ordinals: &[usize]) -> Result<()> {
        let mut first_error = None;
        for &ordinal in ordinals {
            if let Err(error) = self.create(ordinal) {
                tracing::warn!(module = %self.id, device = ordinal, %error, "module rebuild failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}
