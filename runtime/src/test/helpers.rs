//! Shared fixture: a host platform with programs registered and a context on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use strix_device::host::{HostPlatform, HostPlatformConfig, HostStats};
use strix_device::{Aabb, SBT_RECORD_HEADER_SIZE};
use strix_dtype::{VarDecl, VarType};

use crate::{Context, ContextConfig, GeomType, GpuSelection, Module, ProgramDesc, RayGen, RayGenType};

pub const SOURCE: &str = "\
.version 7.0
.target sm_75
.address_size 64

.visible .entry __raygen__main(
)
.visible .entry __closesthit__shade(
)
.visible .entry __anyhit__shadow(
)
.visible .entry __intersection__sphere(
)
.visible .entry __bounds__sphere(
    .param .u64 geom_data
)
";

/// What the raygen program saw at pixel (0, 0) of one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct RayGenCall {
    pub device: usize,
    pub record_data: Vec<u8>,
    pub params: Option<Vec<u8>>,
}

pub struct Harness {
    pub platform: Arc<HostPlatform>,
    pub context: Context,
    pub pixels: Arc<AtomicUsize>,
    pub calls: Arc<Mutex<Vec<RayGenCall>>>,
}

/// Context over `devices` healthy host devices, all of them selected.
pub fn harness(devices: usize) -> Harness {
    harness_with(
        HostPlatformConfig::builder().device_count(devices).build(),
        ContextConfig::builder().devices(GpuSelection::All).build(),
    )
    .unwrap()
}

pub fn harness_with(platform: HostPlatformConfig, config: ContextConfig) -> crate::Result<Harness> {
    let platform = Arc::new(HostPlatform::new(platform));
    let pixels = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let (count, log) = (Arc::clone(&pixels), Arc::clone(&calls));
    platform.programs().register_raygen("__raygen__main", move |inv| {
        count.fetch_add(1, Ordering::SeqCst);
        if inv.pixel == [0, 0] {
            log.lock().push(RayGenCall {
                device: inv.device,
                record_data: inv.record_data.to_vec(),
                params: inv.params.map(<[u8]>::to_vec),
            });
        }
    });
    platform.programs().register_bounds("__bounds__sphere", sphere_bounds);

    let context = Context::new(Arc::clone(&platform) as Arc<dyn strix_device::Platform>, config)?;
    Ok(Harness { platform, context, pixels, calls })
}

/// Sphere `prim_id` sits at `center + (prim_id, 0, 0)` with the shared radius.
fn sphere_bounds(inv: &strix_device::host::BoundsInvocation<'_>) -> Aabb {
    let read = |at: usize| bytemuck::pod_read_unaligned::<f32>(&inv.geom_data[at..at + 4]);
    let center = [read(0) + inv.prim_id as f32, read(4), read(8)];
    let radius = read(12);
    Aabb::new(center.map(|c| c - radius), center.map(|c| c + radius))
}

pub fn sphere_vars() -> Vec<VarDecl> {
    vec![VarDecl::new("center", VarType::FLOAT3, 0), VarDecl::new("radius", VarType::FLOAT, 12)]
}

pub fn raygen_vars() -> Vec<VarDecl> {
    vec![VarDecl::new("color", VarType::FLOAT3, 0), VarDecl::new("frame", VarType::INT, 12)]
}

impl Harness {
    pub fn module(&self) -> Arc<Module> {
        self.context.create_module(SOURCE)
    }

    pub fn raygen_type(&self, module: &Arc<Module>) -> Arc<RayGenType> {
        self.context.create_raygen_type(Some(ProgramDesc::new(module, "__raygen__main")), 16, raygen_vars()).unwrap()
    }

    pub fn raygen(&self, module: &Arc<Module>) -> Arc<RayGen> {
        self.context.create_raygen(&self.raygen_type(module))
    }

    /// User geometry type with every program set on every ray type.
    pub fn sphere_type(&self, module: &Arc<Module>) -> Arc<GeomType> {
        let ty = self.context.create_user_geom_type(16, sphere_vars()).unwrap();
        for ray_type in 0..self.context.ray_type_count() {
            ty.set_closest_hit(ray_type, ProgramDesc::new(module, "__closesthit__shade")).unwrap();
            ty.set_any_hit(ray_type, ProgramDesc::new(module, "__anyhit__shadow")).unwrap();
            ty.set_intersection(ray_type, ProgramDesc::new(module, "__intersection__sphere")).unwrap();
        }
        ty.set_bounds(ProgramDesc::new(module, "__bounds__sphere")).unwrap();
        ty
    }

    pub fn stats(&self, index: usize) -> HostStats {
        self.platform.backend(index).map(|backend| backend.stats()).unwrap_or_default()
    }

    /// Live modules and program groups summed over every opened device.
    pub fn live_resources(&self) -> (usize, usize) {
        (0..self.platform.config().device_count)
            .map(|index| self.stats(index))
            .fold((0, 0), |(modules, groups), stats| (modules + stats.live_modules, groups + stats.live_program_groups))
    }

    pub fn live_buffers(&self, index: usize) -> usize {
        self.platform.allocator(index).map(|allocator| allocator.live_buffers()).unwrap_or(0)
    }
}

/// Split a record into its header and payload.
pub fn split_record(bytes: &[u8]) -> (&[u8], &[u8]) {
    bytes.split_at(SBT_RECORD_HEADER_SIZE)
}
