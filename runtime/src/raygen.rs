//! Ray-generation types and objects.

use std::sync::{Arc, Weak};

use smallvec::smallvec;
use snafu::{OptionExt, ensure};
use strix_device::{Device, ProgramGroupDesc, ProgramGroupHandle, RayGenLaunch, Work};

use crate::context::ContextInner;
use crate::error::{ContextDroppedSnafu, InvalidLaunchDimsSnafu, MissingProgramSnafu, Result};
use crate::launch_params::LaunchParams;
use crate::layout::{HasVariables, InstanceVariables, VariableLayout};
use crate::object::{ObjectId, ObjectKind, RegisteredObject};
use crate::program::{ProgramDesc, ProgramRole};
use crate::registry::DeviceDataRegistry;
use crate::sbt::{RecordStamp, SbtRecord};

#[derive(Debug)]
pub(crate) struct RayGenTypeDevice {
    device: Arc<Device>,
    group: ProgramGroupHandle,
    module_generation: u64,
}

impl Drop for RayGenTypeDevice {
    fn drop(&mut self) {
        if let Err(error) = self.device.backend().destroy_program_group(self.group) {
            tracing::warn!(device = self.device.ordinal(), group = %self.group, %error, "failed to destroy program group");
        }
    }
}

/// Variable layout plus the ray-generation program shared by many [`RayGen`]s.
#[derive(Debug)]
pub struct RayGenType {
    id: ObjectId,
    context: Weak<ContextInner>,
    program: Option<ProgramDesc>,
    layout: VariableLayout,
    devices: DeviceDataRegistry<RayGenTypeDevice>,
}

impl RayGenType {
    pub(crate) fn new(
        id: ObjectId,
        context: Weak<ContextInner>,
        program: Option<ProgramDesc>,
        layout: VariableLayout,
        active: &[bool],
    ) -> Self {
        Self { id, context, program, layout, devices: DeviceDataRegistry::new(id, ObjectKind::RayGenType, active) }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    pub fn program(&self) -> Option<&ProgramDesc> {
        self.program.as_ref()
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    /// Program group on device `ordinal`, (re)built if missing or its module was recompiled.
    pub(crate) fn program_group(&self, ordinal: usize) -> Result<Arc<RayGenTypeDevice>> {
        let program = self.program.as_ref().context(MissingProgramSnafu { role: ProgramRole::RayGen })?;
        self.devices.ensure_fresh(
            ordinal,
            |current| program.module.is_current(ordinal, current.module_generation),
            || self.build_group(program, ordinal),
        )
    }

    #[tracing::instrument(skip_all, fields(raygen_type = %self.id, device = ordinal))]
    fn build_group(&self, program: &ProgramDesc, ordinal: usize) -> Result<RayGenTypeDevice> {
        let device = self.context()?.device(ordinal)?;
        let (entry, compiled) = program.resolve(ordinal)?;
        let group = device.backend().create_program_group(&ProgramGroupDesc::RayGen(entry))?;
        tracing::debug!(%group, generation = compiled.generation, "raygen program group built");
        Ok(RayGenTypeDevice { device, group, module_generation: compiled.generation })
    }

    /// Program group currently built on device `ordinal`, if it is up to date.
    pub fn group(&self, ordinal: usize) -> Option<ProgramGroupHandle> {
        let program = self.program.as_ref()?;
        let current = self.devices.get(ordinal).ok()?;
        program.module.is_current(ordinal, current.module_generation).then_some(current.group)
    }
}

impl RegisteredObject for RayGenType {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::RayGenType
    }

    fn grow_devices(&self, slots: usize) {
        self.devices.grow(slots);
    }

    fn retire_device(&self, ordinal: usize) -> Result<()> {
        self.devices.retire(ordinal).map(|_| ())
    }

    fn rebuild_programs(&self, ordinals: &[usize]) -> Result<()> {
        if self.program.is_none() {
            return Ok(());
        }
        ordinals.iter().try_for_each(|&ordinal| self.program_group(ordinal).map(|_| ()))
    }
}

impl Drop for RayGenType {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}

#[derive(Debug)]
struct RayGenDevice {
    device: Arc<Device>,
    record: SbtRecord,
}

/// A ray-generation object: a [`RayGenType`] plus variable values and one SBT record per device.
#[derive(Debug)]
pub struct RayGen {
    id: ObjectId,
    context: Weak<ContextInner>,
    ty: Arc<RayGenType>,
    vars: InstanceVariables,
    devices: DeviceDataRegistry<RayGenDevice>,
}

impl RayGen {
    pub(crate) fn new(id: ObjectId, context: Weak<ContextInner>, ty: Arc<RayGenType>, active: &[bool]) -> Self {
        let vars = InstanceVariables::new(ty.layout().clone());
        Self { id, context, ty, vars, devices: DeviceDataRegistry::new(id, ObjectKind::RayGen, active) }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn ty(&self) -> &Arc<RayGenType> {
        &self.ty
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    fn per_device(&self, ordinal: usize) -> Result<Arc<RayGenDevice>> {
        self.devices.ensure(ordinal, || {
            let device = self.context()?.device(ordinal)?;
            let record = SbtRecord::allocate(&device, self.vars.layout().struct_size(), 1)?;
            Ok(RayGenDevice { device, record })
        })
    }

    /// Write the SBT record on device `ordinal` if variables or the program group changed.
    ///
    /// Returns whether the record was rewritten.
    pub fn write_record(&self, ordinal: usize) -> Result<bool> {
        let per_device = self.per_device(ordinal)?;
        let group = self.ty.program_group(ordinal)?.group;
        let (payload, vars_version) = self.vars.snapshot();
        let stamp = RecordStamp { vars_version, groups: smallvec![group] };
        if per_device.record.is_current(&stamp) {
            return Ok(false);
        }

        let header = per_device.device.backend().pack_header(group)?;
        let written = per_device.record.write(&per_device.device, &[header], &payload, stamp)?;
        tracing::debug!(raygen = %self.id, device = ordinal, %group, vars_version, "raygen record written");
        Ok(written)
    }

    /// Refresh records on every active device.
    pub fn build(&self) -> Result<()> {
        self.context()?.active_ordinals().into_iter().try_for_each(|ordinal| self.write_record(ordinal).map(|_| ()))
    }

    /// Current record bytes on device `ordinal`.
    pub fn record_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        Ok(self.devices.get(ordinal)?.record.buffer().to_vec())
    }

    /// Whether the record on device `ordinal` matches the current variables and program group.
    pub fn is_record_current(&self, ordinal: usize) -> Result<bool> {
        let per_device = self.devices.get(ordinal)?;
        let Some(group) = self.ty.group(ordinal) else { return Ok(false) };
        Ok(per_device.record.is_current(&RecordStamp { vars_version: self.vars.version(), groups: smallvec![group] }))
    }

    /// Device ordinals holding a record.
    pub fn materialized_devices(&self) -> Vec<usize> {
        self.devices.materialized()
    }

    /// Launch on every active device and wait for completion.
    #[tracing::instrument(skip_all, fields(raygen = %self.id, ?dims))]
    pub fn launch(&self, dims: [u32; 2]) -> Result<()> {
        for device in self.submit(dims, None)? {
            device.synchronize()?;
        }
        Ok(())
    }

    /// Submit a launch with `params` to every active device without waiting.
    ///
    /// Completion is observed through [`LaunchParams::sync`].
    #[tracing::instrument(skip_all, fields(raygen = %self.id, params = %params.id(), ?dims))]
    pub fn launch_async(&self, dims: [u32; 2], params: &LaunchParams) -> Result<()> {
        self.submit(dims, Some(params)).map(|_| ())
    }

    fn submit(&self, dims: [u32; 2], params: Option<&LaunchParams>) -> Result<Vec<Arc<Device>>> {
        ensure!(dims[0] > 0 && dims[1] > 0, InvalidLaunchDimsSnafu { dims });

        let devices = self.context()?.active_devices();
        for device in &devices {
            let ordinal = device.ordinal();
            self.write_record(ordinal)?;
            let per_device = self.devices.get(ordinal)?;
            let group = self.ty.program_group(ordinal)?.group;
            let params_buffer = params.map(|params| params.upload(ordinal)).transpose()?;

            let work = RayGenLaunch { group, record: per_device.record.buffer().clone(), dims, params: params_buffer };
            let seq = device.queue().submit(Work::RayGen(work))?;
            per_device.record.mark_used(seq);
            if let Some(params) = params {
                params.mark_used(ordinal, seq);
            }
            tracing::trace!(device = ordinal, seq, "raygen launch submitted");
        }
        Ok(devices)
    }
}

impl HasVariables for RayGen {
    fn variables(&self) -> &InstanceVariables {
        &self.vars
    }
}

impl RegisteredObject for RayGen {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::RayGen
    }

    fn grow_devices(&self, slots: usize) {
        self.devices.grow(slots);
    }

    fn retire_device(&self, ordinal: usize) -> Result<()> {
        self.devices.retire(ordinal).map(|_| ())
    }

    fn refresh_records(&self, ordinals: &[usize]) -> Result<()> {
        ordinals.iter().try_for_each(|&ordinal| self.write_record(ordinal).map(|_| ()))
    }
}

impl Drop for RayGen {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}
