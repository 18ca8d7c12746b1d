//! Geometry types and geometry objects.
//!
//! A [`GeomType`] carries one hit group per ray type. User geometry types add
//! an intersection program per ray type and a bounds program, which is loaded
//! as a standalone kernel and launched directly over the primitives of a
//! [`Geom`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use strix_device::{Aabb, BoundsLaunch, Device, DeviceBuffer, EntryPoint, KernelHandle, ProgramGroupDesc, Work};

use crate::context::ContextInner;
use crate::error::{
    ContextDroppedSnafu, MissingProgramSnafu, NoViableDevicesSnafu, NotUserGeometrySnafu, OutOfRangeSnafu,
    ResourceExhaustedSnafu, Result,
};
use crate::layout::{HasVariables, InstanceVariables, VariableLayout};
use crate::module::Module;
use crate::object::{ObjectId, ObjectKind, RegisteredObject};
use crate::program::{ProgramDesc, ProgramRole};
use crate::registry::DeviceDataRegistry;
use crate::sbt::{GroupList, RecordStamp, SbtRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GeomKind {
    Triangles,
    User,
}

#[derive(Debug, Clone, Default)]
struct RayTypePrograms {
    closest_hit: Option<ProgramDesc>,
    any_hit: Option<ProgramDesc>,
    intersection: Option<ProgramDesc>,
}

#[derive(Debug, Clone)]
struct GeomPrograms {
    per_ray_type: Vec<RayTypePrograms>,
    bounds: Option<ProgramDesc>,
}

#[derive(Debug)]
pub(crate) struct GeomTypeDevice {
    device: Arc<Device>,
    hit_groups: GroupList,
    /// Every module the groups and kernel were built from, with its generation.
    modules: SmallVec<[(Arc<Module>, u64); 4]>,
    bounds_kernel: Option<KernelHandle>,
}

impl GeomTypeDevice {
    fn is_current(&self) -> bool {
        let ordinal = self.device.ordinal();
        self.modules.iter().all(|(module, generation)| module.is_current(ordinal, *generation))
    }

    fn resolve(&mut self, program: Option<&ProgramDesc>) -> Result<Option<EntryPoint>> {
        let Some(program) = program else { return Ok(None) };
        let (entry, compiled) = program.resolve(self.device.ordinal())?;
        self.modules.push((Arc::clone(&program.module), compiled.generation));
        Ok(Some(entry))
    }
}

impl Drop for GeomTypeDevice {
    fn drop(&mut self) {
        for group in self.hit_groups.drain(..) {
            if let Err(error) = self.device.backend().destroy_program_group(group) {
                tracing::warn!(device = self.device.ordinal(), %group, %error, "failed to destroy hit group");
            }
        }
    }
}

#[derive(Debug)]
pub struct GeomType {
    id: ObjectId,
    context: Weak<ContextInner>,
    kind: GeomKind,
    layout: VariableLayout,
    programs: RwLock<GeomPrograms>,
    devices: DeviceDataRegistry<GeomTypeDevice>,
}

impl GeomType {
    pub(crate) fn new(
        id: ObjectId,
        context: Weak<ContextInner>,
        kind: GeomKind,
        layout: VariableLayout,
        ray_types: usize,
        active: &[bool],
    ) -> Self {
        let programs = GeomPrograms { per_ray_type: vec![RayTypePrograms::default(); ray_types], bounds: None };
        Self {
            id,
            context,
            kind,
            layout,
            programs: RwLock::new(programs),
            devices: DeviceDataRegistry::new(id, ObjectKind::GeomType, active),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> GeomKind {
        self.kind
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    pub fn ray_type_count(&self) -> usize {
        self.programs.read().per_ray_type.len()
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    fn ensure_user(&self) -> Result<()> {
        ensure!(self.kind == GeomKind::User, NotUserGeometrySnafu { object: self.id });
        Ok(())
    }

    /// Change one program and drop every per-device group built from the old set.
    fn update(&self, ray_type: usize, apply: impl FnOnce(&mut RayTypePrograms)) -> Result<()> {
        {
            let mut programs = self.programs.write();
            let count = programs.per_ray_type.len();
            let slot = programs
                .per_ray_type
                .get_mut(ray_type)
                .context(OutOfRangeSnafu { what: "ray type", index: ray_type, count })?;
            apply(slot);
        }
        self.devices.invalidate_all();
        Ok(())
    }

    pub fn set_closest_hit(&self, ray_type: usize, program: ProgramDesc) -> Result<()> {
        self.update(ray_type, |slot| slot.closest_hit = Some(program))
    }

    pub fn set_any_hit(&self, ray_type: usize, program: ProgramDesc) -> Result<()> {
        self.update(ray_type, |slot| slot.any_hit = Some(program))
    }

    pub fn set_intersection(&self, ray_type: usize, program: ProgramDesc) -> Result<()> {
        self.ensure_user()?;
        self.update(ray_type, |slot| slot.intersection = Some(program))
    }

    pub fn set_bounds(&self, program: ProgramDesc) -> Result<()> {
        self.ensure_user()?;
        self.programs.write().bounds = Some(program);
        self.devices.invalidate_all();
        Ok(())
    }

    /// Hit groups and bounds kernel on device `ordinal`, rebuilt if any module was recompiled.
    pub(crate) fn device_programs(&self, ordinal: usize) -> Result<Arc<GeomTypeDevice>> {
        self.devices.ensure_fresh(ordinal, GeomTypeDevice::is_current, || self.build(ordinal))
    }

    #[tracing::instrument(skip_all, fields(geom_type = %self.id, device = ordinal))]
    fn build(&self, ordinal: usize) -> Result<GeomTypeDevice> {
        let device = self.context()?.device(ordinal)?;
        let programs = self.programs.read().clone();

        // Dropping `built` on an error path releases the groups created so far.
        let mut built =
            GeomTypeDevice { device, hit_groups: GroupList::new(), modules: SmallVec::new(), bounds_kernel: None };
        for ray_type in &programs.per_ray_type {
            let desc = ProgramGroupDesc::HitGroup {
                closest_hit: built.resolve(ray_type.closest_hit.as_ref())?,
                any_hit: built.resolve(ray_type.any_hit.as_ref())?,
                intersection: built.resolve(ray_type.intersection.as_ref())?,
            };
            let group = built.device.backend().create_program_group(&desc)?;
            built.hit_groups.push(group);
        }
        if let Some(entry) = built.resolve(programs.bounds.as_ref())? {
            built.bounds_kernel = Some(built.device.backend().load_kernel(&entry)?);
        }

        tracing::debug!(groups = built.hit_groups.len(), bounds = built.bounds_kernel.is_some(), "geometry programs built");
        Ok(built)
    }

    /// Hit groups currently built on device `ordinal`, one per ray type, if up to date.
    pub fn hit_groups(&self, ordinal: usize) -> Option<GroupList> {
        let current = self.devices.get(ordinal).ok()?;
        current.is_current().then(|| current.hit_groups.clone())
    }

    fn bounds_kernel(&self, ordinal: usize) -> Result<KernelHandle> {
        self.ensure_user()?;
        ensure!(self.programs.read().bounds.is_some(), MissingProgramSnafu { role: ProgramRole::Bounds });
        self.device_programs(ordinal)?.bounds_kernel.context(MissingProgramSnafu { role: ProgramRole::Bounds })
    }
}

impl RegisteredObject for GeomType {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::GeomType
    }

    fn grow_devices(&self, slots: usize) {
        self.devices.grow(slots);
    }

    fn retire_device(&self, ordinal: usize) -> Result<()> {
        self.devices.retire(ordinal).map(|_| ())
    }

    fn rebuild_programs(&self, ordinals: &[usize]) -> Result<()> {
        ordinals.iter().try_for_each(|&ordinal| self.device_programs(ordinal).map(|_| ()))
    }
}

impl Drop for GeomType {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}

#[derive(Debug)]
struct BoundsScratch {
    buffer: DeviceBuffer,
    prim_count: usize,
    vars_version: u64,
    kernel: KernelHandle,
    /// Queue item filling `buffer`.
    seq: u64,
    /// Set once that item is known to have succeeded.
    confirmed: bool,
}

impl BoundsScratch {
    fn matches(&self, prim_count: usize, vars_version: u64, kernel: KernelHandle) -> bool {
        self.prim_count == prim_count && self.vars_version == vars_version && self.kernel == kernel
    }
}

#[derive(Debug)]
struct GeomDevice {
    device: Arc<Device>,
    record: SbtRecord,
    bounds: Mutex<Option<BoundsScratch>>,
}

/// A geometry object: hit records for every ray type plus, for user geometry,
/// a primitive count and a bounds buffer.
#[derive(Debug)]
pub struct Geom {
    id: ObjectId,
    context: Weak<ContextInner>,
    ty: Arc<GeomType>,
    vars: InstanceVariables,
    prim_count: AtomicUsize,
    devices: DeviceDataRegistry<GeomDevice>,
}

impl Geom {
    pub(crate) fn new(id: ObjectId, context: Weak<ContextInner>, ty: Arc<GeomType>, active: &[bool]) -> Self {
        let vars = InstanceVariables::new(ty.layout().clone());
        Self {
            id,
            context,
            ty,
            vars,
            prim_count: AtomicUsize::new(0),
            devices: DeviceDataRegistry::new(id, ObjectKind::Geom, active),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn ty(&self) -> &Arc<GeomType> {
        &self.ty
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context.upgrade().context(ContextDroppedSnafu { object: self.id })
    }

    pub fn prim_count(&self) -> usize {
        self.prim_count.load(Ordering::Acquire)
    }

    /// Set the number of primitives the bounds program runs over. User geometry only.
    pub fn set_prim_count(&self, prim_count: usize) -> Result<()> {
        self.ty.ensure_user()?;
        self.prim_count.store(prim_count, Ordering::Release);
        Ok(())
    }

    fn per_device(&self, ordinal: usize) -> Result<Arc<GeomDevice>> {
        self.devices.ensure(ordinal, || {
            let device = self.context()?.device(ordinal)?;
            let record =
                SbtRecord::allocate(&device, self.vars.layout().struct_size(), self.ty.ray_type_count())?;
            Ok(GeomDevice { device, record, bounds: Mutex::new(None) })
        })
    }

    /// Write the hit records (one per ray type) on device `ordinal` if stale.
    pub fn write_record(&self, ordinal: usize) -> Result<bool> {
        let per_device = self.per_device(ordinal)?;
        let programs = self.ty.device_programs(ordinal)?;
        let (payload, vars_version) = self.vars.snapshot();
        let stamp = RecordStamp { vars_version, groups: programs.hit_groups.clone() };
        if per_device.record.is_current(&stamp) {
            return Ok(false);
        }

        let backend = per_device.device.backend();
        let headers = programs.hit_groups.iter().map(|group| backend.pack_header(*group)).collect::<Result<Vec<_>, _>>()?;
        let written = per_device.record.write(&per_device.device, &headers, &payload, stamp)?;
        tracing::debug!(geom = %self.id, device = ordinal, vars_version, "hit records written");
        Ok(written)
    }

    /// Refresh records on every active device.
    pub fn build(&self) -> Result<()> {
        self.context()?.active_ordinals().into_iter().try_for_each(|ordinal| self.write_record(ordinal).map(|_| ()))
    }

    pub fn record_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        Ok(self.devices.get(ordinal)?.record.buffer().to_vec())
    }

    pub fn is_record_current(&self, ordinal: usize) -> Result<bool> {
        let per_device = self.devices.get(ordinal)?;
        let Some(groups) = self.ty.hit_groups(ordinal) else { return Ok(false) };
        Ok(per_device.record.is_current(&RecordStamp { vars_version: self.vars.version(), groups }))
    }

    pub fn materialized_devices(&self) -> Vec<usize> {
        self.devices.materialized()
    }

    /// Run the bounds program over all primitives on device `ordinal`.
    ///
    /// Only submits the kernel; the boxes are in [`Geom::bounds_buffer`] once
    /// the device's queue has drained.
    #[tracing::instrument(skip_all, fields(geom = %self.id, device = ordinal))]
    pub fn execute_bounds_prog(&self, ordinal: usize) -> Result<()> {
        let kernel = self.ty.bounds_kernel(ordinal)?;
        let per_device = self.per_device(ordinal)?;
        let prim_count = self.prim_count();
        let (geom_data, vars_version) = self.vars.snapshot();

        let mut scratch = per_device.bounds.lock();
        let buffer = match scratch.as_ref() {
            Some(existing) if existing.prim_count == prim_count => existing.buffer.clone(),
            _ => per_device.device.allocate(bounds_bytes(&per_device.device, prim_count)?)?,
        };
        let seq = if prim_count > 0 {
            let launch = BoundsLaunch { kernel, geom_data, prim_count, output: buffer.clone() };
            let seq = per_device.device.queue().submit(Work::Bounds(launch))?;
            tracing::trace!(seq, prim_count, "bounds launch submitted");
            seq
        } else {
            0
        };
        *scratch = Some(BoundsScratch { buffer, prim_count, vars_version, kernel, seq, confirmed: prim_count == 0 });
        Ok(())
    }

    /// Bounds buffer written by the last bounds launch on device `ordinal`.
    pub fn bounds_buffer(&self, ordinal: usize) -> Result<Option<DeviceBuffer>> {
        Ok(self.devices.get(ordinal)?.bounds.lock().as_ref().map(|scratch| scratch.buffer.clone()))
    }

    /// Union of all primitive boxes, computed on the first active device.
    ///
    /// Reruns the bounds program when the primitive count, the variables or the
    /// kernel changed since its last run. No primitives yield an empty box.
    #[tracing::instrument(skip_all, fields(geom = %self.id))]
    pub fn compute_bounds(&self) -> Result<Aabb> {
        self.ty.ensure_user()?;
        let prim_count = self.prim_count();
        if prim_count == 0 {
            return Ok(Aabb::empty());
        }

        let device = self
            .context()?
            .active_devices()
            .into_iter()
            .next()
            .context(NoViableDevicesSnafu { reason: "context has no active devices" })?;
        let ordinal = device.ordinal();
        let kernel = self.ty.bounds_kernel(ordinal)?;
        let per_device = self.per_device(ordinal)?;

        let vars_version = self.vars.version();
        let fresh =
            per_device.bounds.lock().as_ref().is_some_and(|scratch| scratch.matches(prim_count, vars_version, kernel));
        if !fresh {
            self.execute_bounds_prog(ordinal)?;
        }

        let unconfirmed =
            per_device.bounds.lock().as_ref().filter(|scratch| !scratch.confirmed).map(|scratch| scratch.seq);
        if let Some(seq) = unconfirmed {
            // Other items on the queue may have failed; only this launch decides.
            let outcome = device.queue().wait_item(seq);
            let mut scratch = per_device.bounds.lock();
            let ours = scratch.as_ref().is_some_and(|scratch| scratch.seq == seq);
            match outcome {
                Err(error) => {
                    if ours {
                        *scratch = None;
                    }
                    tracing::warn!(seq, %error, "bounds launch failed");
                    return Err(error.into());
                }
                Ok(()) => {
                    if let Some(scratch) = scratch.as_mut().filter(|_| ours) {
                        scratch.confirmed = true;
                    }
                }
            }
        }

        let bytes = match per_device.bounds.lock().as_ref() {
            Some(scratch) => scratch.buffer.to_vec(),
            None => Vec::new(),
        };
        let bounds = bytes
            .chunks_exact(Aabb::BYTES)
            .map(bytemuck::pod_read_unaligned::<Aabb>)
            .fold(Aabb::empty(), |acc, prim| acc.union(&prim));
        tracing::debug!(prim_count, ?bounds, "bounds computed");
        Ok(bounds)
    }
}

/// Size of a bounds buffer for `prim_count` boxes, bounded by the device memory.
fn bounds_bytes(device: &Device, prim_count: usize) -> Result<usize> {
    let available = device.info().memory_bytes;
    let bytes = prim_count.checked_mul(Aabb::BYTES).unwrap_or(usize::MAX);
    ensure!(bytes <= available, ResourceExhaustedSnafu { device: device.ordinal(), requested: bytes, available });
    Ok(bytes)
}

impl HasVariables for Geom {
    fn variables(&self) -> &InstanceVariables {
        &self.vars
    }
}

impl RegisteredObject for Geom {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Geom
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

impl Drop for Geom {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.unregister(self.id);
        }
    }
}
