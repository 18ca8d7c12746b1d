//! The context: device set, compile options and the table of live objects.

use std::cmp::Reverse;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use snafu::{OptionExt, ensure};
use strix_device::{CompileOptions, Device, DeviceInfo, Platform};
use strix_dtype::VarDecl;

use crate::config::{ContextConfig, GpuSelection};
use crate::error::{
    DeviceRetiredSnafu, Error, NoViableDevicesSnafu, OutOfRangeSnafu, Result, UnimplementedOperationSnafu,
};
use crate::geom::{Geom, GeomKind, GeomType};
use crate::launch_params::LaunchParams;
use crate::layout::VariableLayout;
use crate::module::Module;
use crate::object::{ObjectId, ObjectKind, RegisteredObject};
use crate::program::ProgramDesc;
use crate::raygen::{RayGen, RayGenType};

#[derive(Debug)]
struct ContextState {
    /// One slot per ordinal ever assigned; `None` once the device is removed.
    devices: Vec<Option<Arc<Device>>>,
    options: CompileOptions,
}

pub(crate) struct ContextInner {
    platform: Arc<dyn Platform>,
    ray_types: usize,
    state: RwLock<ContextState>,
    objects: papaya::HashMap<ObjectId, Weak<dyn RegisteredObject>>,
}

impl std::fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextInner")
            .field("platform", &self.platform)
            .field("ray_types", &self.ray_types)
            .field("state", &*self.state.read())
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl ContextInner {
    pub(crate) fn device(&self, ordinal: usize) -> Result<Arc<Device>> {
        let state = self.state.read();
        let count = state.devices.len();
        let slot = state.devices.get(ordinal).context(OutOfRangeSnafu { what: "device", index: ordinal, count })?;
        slot.clone().context(DeviceRetiredSnafu { ordinal })
    }

    pub(crate) fn active_devices(&self) -> Vec<Arc<Device>> {
        self.state.read().devices.iter().flatten().cloned().collect()
    }

    pub(crate) fn active_ordinals(&self) -> Vec<usize> {
        self.state.read().devices.iter().enumerate().filter(|(_, slot)| slot.is_some()).map(|(i, _)| i).collect()
    }

    pub(crate) fn compile_options(&self) -> CompileOptions {
        self.state.read().options.clone()
    }

    pub(crate) fn unregister(&self, id: ObjectId) {
        self.objects.pin().remove(&id);
    }

    /// Live objects in dependency order (modules first).
    fn live_objects(&self) -> Vec<Arc<dyn RegisteredObject>> {
        let mut objects: Vec<_> = self.objects.pin().values().filter_map(Weak::upgrade).collect();
        objects.sort_by_key(|object| (object.kind().rank(), object.id()));
        objects
    }

    pub(crate) fn synchronize(&self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        for device in self.active_devices() {
            if let Err(error) = device.synchronize() {
                first_error.get_or_insert(error.into());
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Build an object with slots matching the current device set and add it to the table.
    ///
    /// Holds the state lock so a concurrent device add or remove sees the object.
    fn register<T>(self: &Arc<Self>, build: impl FnOnce(ObjectId, Weak<ContextInner>, &[bool]) -> T) -> Arc<T>
    where
        T: RegisteredObject + 'static,
    {
        let state = self.state.read();
        let active: Vec<bool> = state.devices.iter().map(Option::is_some).collect();
        let object = Arc::new(build(ObjectId::next(), Arc::downgrade(self), &active));
        let weak: Weak<dyn RegisteredObject> = Arc::downgrade(&object) as Weak<dyn RegisteredObject>;
        self.objects.pin().insert(object.id(), weak);
        drop(state);

        tracing::debug!(object = %object.id(), kind = %object.kind(), "object registered");
        object
    }
}

/// Owns the devices and every object created through it.
///
/// Objects keep a weak reference back to their context. Once the context is
/// dropped, operations that need it fail with `ContextDropped`, while the
/// objects themselves can still be dropped and release their device resources.
#[derive(Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    #[tracing::instrument(skip_all, fields(devices = ?config.devices, ray_types = config.ray_types))]
    pub fn new(platform: Arc<dyn Platform>, config: ContextConfig) -> Result<Self> {
        if config.ray_types == 0 {
            tracing::warn!("ray type count of 0 raised to 1");
        }
        let devices = open_devices(&*platform, &config.devices)?;
        tracing::debug!(count = devices.len(), "context created");

        let state = ContextState {
            devices: devices.into_iter().map(|device| Some(Arc::new(device))).collect(),
            options: config.compile_options,
        };
        let inner = ContextInner {
            platform,
            ray_types: config.ray_types.max(1),
            state: RwLock::new(state),
            objects: papaya::HashMap::new(),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    /// Active devices in ordinal order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.active_devices()
    }

    pub fn device(&self, ordinal: usize) -> Result<Arc<Device>> {
        self.inner.device(ordinal)
    }

    /// Number of device slots, including removed devices.
    pub fn device_slots(&self) -> usize {
        self.inner.state.read().devices.len()
    }

    pub fn ray_type_count(&self) -> usize {
        self.inner.ray_types
    }

    pub fn compile_options(&self) -> CompileOptions {
        self.inner.compile_options()
    }

    /// Ids and kinds of every live object, modules first.
    pub fn live_objects(&self) -> Vec<(ObjectId, ObjectKind)> {
        self.inner.live_objects().iter().map(|object| (object.id(), object.kind())).collect()
    }

    /// Open platform device `index` and append it as a new ordinal.
    ///
    /// Every live object gains a vacant slot; nothing is compiled until used.
    #[tracing::instrument(skip(self))]
    pub fn add_device(&self, index: usize) -> Result<usize> {
        let mut state = self.inner.state.write();
        let ordinal = state.devices.len();
        let device = Device::open(&*self.inner.platform, index, ordinal)?;
        state.devices.push(Some(Arc::new(device)));
        let slots = state.devices.len();
        let objects = self.inner.live_objects();
        drop(state);

        for object in &objects {
            object.grow_devices(slots);
        }
        tracing::debug!(ordinal, objects = objects.len(), "device added");
        Ok(ordinal)
    }

    /// Remove the device at `ordinal`, releasing every object's state on it.
    ///
    /// The slot is tombstoned, never reused. Removing a removed device is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn remove_device(&self, ordinal: usize) -> Result<()> {
        let (device, mut objects) = {
            let mut state = self.inner.state.write();
            let count = state.devices.len();
            let slot = state.devices.get_mut(ordinal).context(OutOfRangeSnafu { what: "device", index: ordinal, count })?;
            let Some(device) = slot.take() else { return Ok(()) };
            (device, self.inner.live_objects())
        };

        if let Err(error) = device.synchronize() {
            tracing::warn!(%error, "pending work failed on removed device");
        }
        objects.sort_by_key(|object| Reverse(object.kind().rank()));
        for object in &objects {
            if let Err(error) = object.retire_device(ordinal) {
                tracing::warn!(object = %object.id(), %error, "object has no slot for removed device");
            }
        }
        tracing::debug!(objects = objects.len(), "device removed");
        Ok(())
    }

    /// Wait for all work submitted to every active device.
    pub fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    pub fn create_module(&self, source: impl Into<Vec<u8>>) -> Arc<Module> {
        let source = source.into();
        self.inner.register(|id, context, active| Module::new(id, context, source, active))
    }

    pub fn create_raygen_type(
        &self,
        program: Option<ProgramDesc>,
        var_struct_size: usize,
        vars: Vec<VarDecl>,
    ) -> Result<Arc<RayGenType>> {
        let layout = VariableLayout::new(var_struct_size, vars)?;
        Ok(self.inner.register(|id, context, active| RayGenType::new(id, context, program, layout, active)))
    }

    pub fn create_raygen(&self, ty: &Arc<RayGenType>) -> Arc<RayGen> {
        self.inner.register(|id, context, active| RayGen::new(id, context, Arc::clone(ty), active))
    }

    pub fn create_geom_type(&self, kind: GeomKind, var_struct_size: usize, vars: Vec<VarDecl>) -> Result<Arc<GeomType>> {
        let layout = VariableLayout::new(var_struct_size, vars)?;
        let ray_types = self.inner.ray_types;
        Ok(self.inner.register(|id, context, active| GeomType::new(id, context, kind, layout, ray_types, active)))
    }

    pub fn create_user_geom_type(&self, var_struct_size: usize, vars: Vec<VarDecl>) -> Result<Arc<GeomType>> {
        self.create_geom_type(GeomKind::User, var_struct_size, vars)
    }

    pub fn create_geom(&self, ty: &Arc<GeomType>) -> Arc<Geom> {
        self.inner.register(|id, context, active| Geom::new(id, context, Arc::clone(ty), active))
    }

    pub fn create_launch_params(&self, var_struct_size: usize, vars: Vec<VarDecl>) -> Result<Arc<LaunchParams>> {
        let layout = VariableLayout::new(var_struct_size, vars)?;
        Ok(self.inner.register(|id, context, active| LaunchParams::new(id, context, layout, active)))
    }

    /// Recompile every live module on every active device, then rebuild program groups.
    ///
    /// Waits for in-flight work first. Failures on one device do not stop the
    /// others; the first one is returned.
    #[tracing::instrument(skip_all)]
    pub fn build_programs(&self) -> Result<()> {
        self.inner.synchronize()?;
        let ordinals = self.inner.active_ordinals();
        let mut first_error = None;
        for object in self.inner.live_objects() {
            if let Err(error) = object.rebuild_programs(&ordinals) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rewrite every stale SBT record on every active device.
    #[tracing::instrument(skip_all)]
    pub fn build_sbt(&self) -> Result<()> {
        let ordinals = self.inner.active_ordinals();
        let mut first_error = None;
        for object in self.inner.live_objects() {
            if let Err(error) = object.refresh_records(&ordinals) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Swap the compile options and rebuild all programs with them.
    pub fn set_compile_options(&self, options: CompileOptions) -> Result<()> {
        self.inner.state.write().options = options;
        self.build_programs()
    }

    pub fn create_raygen_program(&self, _source: &[u8], _name: &str) -> Result<ProgramDesc> {
        UnimplementedOperationSnafu { operation: "create_raygen_program" }.fail()
    }

    pub fn set_entry_point(&self, _entry_point: usize, _program: &ProgramDesc) -> Result<()> {
        UnimplementedOperationSnafu { operation: "set_entry_point" }.fail()
    }

    pub fn launch_entry_point(&self, _entry_point: usize, _dims: [u32; 2]) -> Result<()> {
        UnimplementedOperationSnafu { operation: "launch_entry_point" }.fail()
    }

    pub fn create_geometry_object(&self, _ty: &Arc<GeomType>, _prim_count: usize) -> Result<Arc<Geom>> {
        UnimplementedOperationSnafu { operation: "create_geometry_object" }.fail()
    }
}

/// Platform indices to try, best first, and how many devices to keep.
fn candidates(platform: &dyn Platform, selection: &GpuSelection) -> (Vec<DeviceInfo>, usize) {
    let usable = |index: usize| match platform.info(index) {
        Ok(info) => Some(info),
        Err(error) => {
            tracing::warn!(device = index, %error, "skipping device");
            None
        }
    };

    let mut infos: Vec<DeviceInfo> = match selection {
        GpuSelection::Explicit(indices) => {
            let mut seen = Vec::with_capacity(indices.len());
            for &index in indices {
                if !seen.contains(&index) {
                    seen.push(index);
                }
            }
            seen.into_iter().filter_map(usable).collect()
        }
        _ => (0..platform.device_count()).filter_map(usable).collect(),
    };

    match selection {
        GpuSelection::First => (infos, 1),
        GpuSelection::FirstPreferRtx => {
            infos.sort_by_key(|info| !info.rtx);
            (infos, 1)
        }
        GpuSelection::Best => {
            infos.sort_by_key(|info| (Reverse(info.rtx), Reverse(info.memory_bytes), info.index));
            (infos, 1)
        }
        GpuSelection::All | GpuSelection::Explicit(_) => {
            let count = infos.len();
            (infos, count)
        }
        GpuSelection::AllRtx => {
            infos.retain(|info| info.rtx);
            let count = infos.len();
            (infos, count)
        }
    }
}

fn open_devices(platform: &dyn Platform, selection: &GpuSelection) -> Result<Vec<Device>> {
    let (candidates, wanted) = candidates(platform, selection);
    let considered = candidates.len();

    let mut devices = Vec::with_capacity(wanted);
    for info in candidates {
        if devices.len() == wanted {
            break;
        }
        match Device::open(platform, info.index, devices.len()) {
            Ok(device) => {
                tracing::debug!(device = %device, "device opened");
                devices.push(device);
            }
            Err(error) => tracing::warn!(device = info.index, %error, "excluding device that failed to open"),
        }
    }

    ensure!(
        !devices.is_empty(),
        NoViableDevicesSnafu { reason: format!("none of {considered} candidate devices could be opened") }
    );
    Ok(devices)
}
