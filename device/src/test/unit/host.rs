use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use test_case::test_case;

use crate::host::{HOST_HEADER_MAGIC, HostPlatform, HostPlatformConfig};
use crate::{
    Aabb, Backend, BoundsLaunch, CompileOptions, Device, EntryPoint, Error, Platform, ProgramGroupDesc, RayGenLaunch,
    SBT_RECORD_HEADER_SIZE, Work,
};

const SOURCE: &str = "\
.version 7.0
.target sm_75
.visible .entry __raygen__main(
)
.visible .entry __bounds__sphere(
    .param .u64 data
)
.visible .entry __closesthit__flat()
";

fn open(platform: &HostPlatform, index: usize) -> Device {
    Device::open(platform, index, index).unwrap()
}

#[test]
fn test_compile_collects_entries() {
    let platform = HostPlatform::with_devices(1);
    let device = open(&platform, 0);
    let backend = device.backend();

    let module = backend.compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    for symbol in ["__raygen__main", "__bounds__sphere", "__closesthit__flat"] {
        backend.create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(module, symbol))).unwrap();
    }
    let stats = platform.backend(0).unwrap().stats();
    assert_eq!(stats.live_modules, 1);
    assert_eq!(stats.live_program_groups, 3);
    assert_eq!(stats.compile_count, 1);
}

#[test_case(b"\xff\xfe".as_slice(), "UTF-8" ; "non utf8")]
#[test_case(b".version 7.0\n".as_slice(), "no .entry" ; "no entries")]
#[test_case(b".entry k(\n.error bad register\n.error missing brace\n".as_slice(), "bad register\nmissing brace" ; "error lines")]
fn test_compile_failure_log(source: &[u8], expected: &str) {
    let platform = HostPlatform::with_devices(1);
    let device = open(&platform, 0);

    let err = device.backend().compile(source, &CompileOptions::default()).unwrap_err();
    let Error::Compilation { device, log } = err else { panic!("expected compilation error, got {err:?}") };
    assert_eq!(device, 0);
    assert!(log.contains(expected), "log: {log}");
    assert_eq!(platform.backend(0).unwrap().stats().live_modules, 0);
}

#[test]
fn test_compile_rejects_deep_tracing() {
    let platform = HostPlatform::with_devices(1);
    let device = open(&platform, 0);
    let options = CompileOptions::builder().max_trace_depth(CompileOptions::MAX_TRACE_DEPTH_LIMIT + 1).build();

    assert!(matches!(device.backend().compile(SOURCE.as_bytes(), &options), Err(Error::Compilation { .. })));
}

#[test]
fn test_failing_compiler_only_on_one_device() {
    let platform = HostPlatform::new(HostPlatformConfig::builder().device_count(2).failing_compilers(vec![1]).build());
    let good = open(&platform, 0);
    let bad = open(&platform, 1);

    good.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    assert!(matches!(
        bad.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()),
        Err(Error::Compilation { device: 1, .. })
    ));
}

#[test]
fn test_program_group_unknown_symbol() {
    let platform = HostPlatform::with_devices(1);
    let device = open(&platform, 0);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();

    let desc = ProgramGroupDesc::HitGroup {
        closest_hit: Some(EntryPoint::new(module, "__closesthit__flat")),
        any_hit: Some(EntryPoint::new(module, "__anyhit__missing")),
        intersection: None,
    };
    let err = device.backend().create_program_group(&desc).unwrap_err();
    assert!(matches!(err, Error::Compilation { ref log, .. } if log.contains("__anyhit__missing")));
}

#[test]
fn test_destroy_twice_is_invalid_handle() {
    let platform = HostPlatform::with_devices(1);
    let device = open(&platform, 0);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();

    device.backend().destroy_module(module).unwrap();
    assert!(matches!(device.backend().destroy_module(module), Err(Error::InvalidHandle { kind: "module", .. })));
}

#[test]
fn test_handles_unique_across_devices() {
    let platform = HostPlatform::with_devices(2);
    let a = open(&platform, 0);
    let b = open(&platform, 1);

    let ma = a.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    let mb = b.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    assert_ne!(ma, mb);

    let ga = a.backend().create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(ma, "__raygen__main"))).unwrap();
    let gb = b.backend().create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(mb, "__raygen__main"))).unwrap();
    assert_ne!(ga, gb);
    assert_ne!(a.backend().pack_header(ga).unwrap(), b.backend().pack_header(gb).unwrap());
}

#[test]
fn test_pack_header_layout() {
    let platform = HostPlatform::with_devices(2);
    let device = open(&platform, 1);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    let group =
        device.backend().create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(module, "__raygen__main"))).unwrap();

    let header = device.backend().pack_header(group).unwrap();
    assert_eq!(header.len(), SBT_RECORD_HEADER_SIZE);
    assert_eq!(header[..8], group.raw().to_le_bytes());
    assert_eq!(header[8..16], 1u64.to_le_bytes());
    assert_eq!(header[16..20], HOST_HEADER_MAGIC);
    assert!(header[20..].iter().all(|b| *b == 0));

    device.backend().destroy_program_group(group).unwrap();
    assert!(device.backend().pack_header(group).is_err());
}

#[test]
fn test_raygen_runs_every_pixel_with_payload() {
    let platform = HostPlatform::with_devices(1);
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (count, log) = (Arc::clone(&hits), Arc::clone(&seen));
    platform.programs().register_raygen("__raygen__main", move |inv| {
        count.fetch_add(1, Ordering::SeqCst);
        log.lock().push((inv.pixel, inv.record_data.to_vec(), inv.params.map(<[u8]>::to_vec)));
    });

    let device = open(&platform, 0);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    let group =
        device.backend().create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(module, "__raygen__main"))).unwrap();

    let record = device.allocate(SBT_RECORD_HEADER_SIZE + 4).unwrap();
    let mut bytes = device.backend().pack_header(group).unwrap().to_vec();
    bytes.extend_from_slice(&[5, 6, 7, 8]);
    record.copyin(&bytes).unwrap();
    let params = device.allocate(2).unwrap();
    params.copyin(&[1, 2]).unwrap();

    device.queue().submit(Work::RayGen(RayGenLaunch { group, record, dims: [4, 3], params: Some(params) })).unwrap();
    device.synchronize().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 12);
    let seen = seen.lock();
    assert!(seen.iter().all(|(pixel, record, params)| {
        pixel[0] < 4 && pixel[1] < 3 && record == &[5, 6, 7, 8] && params.as_deref() == Some(&[1u8, 2][..])
    }));
    assert_eq!(seen.last().map(|(pixel, ..)| *pixel), Some([3, 2]));
    assert_eq!(platform.backend(0).unwrap().stats().raygen_launches, 1);
}

#[test]
fn test_raygen_rejects_stale_header() {
    let platform = HostPlatform::with_devices(1);
    platform.programs().register_raygen("__raygen__main", |_| {});
    let device = open(&platform, 0);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    let group =
        device.backend().create_program_group(&ProgramGroupDesc::RayGen(EntryPoint::new(module, "__raygen__main"))).unwrap();

    // Never written: the header is all zeroes.
    let record = device.allocate(SBT_RECORD_HEADER_SIZE).unwrap();
    device.queue().submit(Work::RayGen(RayGenLaunch { group, record, dims: [1, 1], params: None })).unwrap();

    let err = device.synchronize().unwrap_err();
    assert!(matches!(err, Error::Execution { ref reason, .. } if reason.contains("stale")));
}

#[test]
fn test_bounds_kernel_writes_boxes() {
    let platform = HostPlatform::with_devices(1);
    platform.programs().register_bounds("__bounds__sphere", |inv| {
        let radius = f32::from_le_bytes([inv.geom_data[0], inv.geom_data[1], inv.geom_data[2], inv.geom_data[3]]);
        let center = inv.prim_id as f32;
        Aabb::new([center - radius; 3], [center + radius; 3])
    });

    let device = open(&platform, 0);
    let module = device.backend().compile(SOURCE.as_bytes(), &CompileOptions::default()).unwrap();
    let kernel = device.backend().load_kernel(&EntryPoint::new(module, "__bounds__sphere")).unwrap();
    assert_eq!(device.backend().load_kernel(&EntryPoint::new(module, "__bounds__sphere")).unwrap(), kernel);

    let output = device.allocate(3 * Aabb::BYTES).unwrap();
    let launch = BoundsLaunch { kernel, geom_data: 0.5f32.to_le_bytes().to_vec(), prim_count: 3, output: output.clone() };
    device.queue().submit(Work::Bounds(launch)).unwrap();
    device.synchronize().unwrap();

    let bytes = output.to_vec();
    let third: Aabb = bytemuck::pod_read_unaligned(&bytes[2 * Aabb::BYTES..]);
    assert_eq!(third, Aabb::new([1.5; 3], [2.5; 3]));

    device.backend().destroy_module(module).unwrap();
    assert_eq!(platform.backend(0).unwrap().stats().live_kernels, 0);
}

#[test]
fn test_unavailable_device() {
    let platform = HostPlatform::new(HostPlatformConfig::builder().device_count(2).unavailable(vec![1]).build());

    assert!(platform.open(0).is_ok());
    assert!(matches!(platform.open(1), Err(Error::DeviceUnavailable { index: 1, .. })));
    assert!(matches!(platform.info(2), Err(Error::DeviceUnavailable { index: 2, .. })));
}

#[test]
fn test_device_info() {
    let platform = HostPlatform::new(
        HostPlatformConfig::builder().device_count(2).without_rtx(vec![0]).memory_budget(4096).build(),
    );

    let info = platform.info(0).unwrap();
    assert!(!info.rtx);
    assert_eq!(info.memory_bytes, 4096);
    assert!(platform.info(1).unwrap().rtx);
}
