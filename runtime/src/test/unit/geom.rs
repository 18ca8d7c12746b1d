use strix_device::Aabb;
use strix_device::host::HostPlatformConfig;

use crate::test::helpers::{SOURCE, harness, harness_with, sphere_vars, split_record};
use crate::{ContextConfig, Error, GeomKind, GpuSelection, HasVariables, ProgramDesc, ProgramRole};

#[test]
fn test_bounds_of_many_spheres() {
    let h = harness(1);
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));
    geom.set("center", [0.0f32, 1.0, 2.0]).unwrap();
    geom.set("radius", 0.5f32).unwrap();
    geom.set_prim_count(1000).unwrap();

    let bounds = geom.compute_bounds().unwrap();
    assert_eq!(bounds, Aabb::new([-0.5, 0.5, 1.5], [999.5, 1.5, 2.5]));
    assert_eq!(h.stats(0).bounds_launches, 1);
}

#[test]
fn test_no_primitives_yield_empty_box() {
    let h = harness(1);
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));

    let bounds = geom.compute_bounds().unwrap();
    assert!(bounds.is_empty());
    assert_eq!(h.stats(0).bounds_launches, 0);
}

#[test]
fn test_bounds_rerun_only_when_stale() {
    let h = harness(1);
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));
    geom.set("radius", 1.0f32).unwrap();
    geom.set_prim_count(2).unwrap();

    let first = geom.compute_bounds().unwrap();
    assert_eq!(geom.compute_bounds().unwrap(), first);
    assert_eq!(h.stats(0).bounds_launches, 1);

    geom.set("radius", 2.0f32).unwrap();
    let grown = geom.compute_bounds().unwrap();
    assert_eq!(grown, Aabb::new([-2.0; 3], [3.0, 2.0, 2.0]));
    assert!(grown.contains(&first));
    assert_eq!(h.stats(0).bounds_launches, 2);

    geom.set_prim_count(3).unwrap();
    assert_eq!(geom.compute_bounds().unwrap().max[0], 4.0);
    assert_eq!(h.stats(0).bounds_launches, 3);
}

#[test]
fn test_execute_fills_bounds_buffer() {
    let h = harness(2);
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));
    geom.set("radius", 0.25f32).unwrap();
    geom.set_prim_count(4).unwrap();

    assert!(matches!(geom.bounds_buffer(1), Err(Error::DeviceDataMissing { ordinal: 1, .. })));
    geom.execute_bounds_prog(1).unwrap();
    h.context.synchronize().unwrap();

    let buffer = geom.bounds_buffer(1).unwrap().unwrap();
    assert_eq!(buffer.size(), 4 * Aabb::BYTES);
    let bytes = buffer.to_vec();
    let last = bytemuck::pod_read_unaligned::<Aabb>(&bytes[3 * Aabb::BYTES..]);
    assert_eq!(last, Aabb::new([2.75, -0.25, -0.25], [3.25, 0.25, 0.25]));
    assert_eq!(h.stats(0).bounds_launches, 0);
}

#[test]
fn test_triangles_reject_user_operations() {
    let h = harness(1);
    let module = h.module();
    let ty = h.context.create_geom_type(GeomKind::Triangles, 0, vec![]).unwrap();
    ty.set_closest_hit(0, ProgramDesc::new(&module, "__closesthit__shade")).unwrap();
    let geom = h.context.create_geom(&ty);

    assert!(matches!(geom.set_prim_count(3), Err(Error::NotUserGeometry { .. })));
    assert!(matches!(
        ty.set_intersection(0, ProgramDesc::new(&module, "__intersection__sphere")),
        Err(Error::NotUserGeometry { .. })
    ));
    assert!(matches!(geom.compute_bounds(), Err(Error::NotUserGeometry { object }) if object == ty.id()));

    geom.build().unwrap();
    assert_eq!(ty.hit_groups(0).map(|groups| groups.len()), Some(1));
}

#[test]
fn test_missing_bounds_program() {
    let h = harness(1);
    let module = h.module();
    let ty = h.context.create_user_geom_type(16, sphere_vars()).unwrap();
    ty.set_intersection(0, ProgramDesc::new(&module, "__intersection__sphere")).unwrap();
    let geom = h.context.create_geom(&ty);
    geom.set_prim_count(4).unwrap();

    assert!(matches!(geom.compute_bounds(), Err(Error::MissingProgram { role: ProgramRole::Bounds })));
    assert!(matches!(geom.execute_bounds_prog(0), Err(Error::MissingProgram { role: ProgramRole::Bounds })));
}

#[test]
fn test_failed_bounds_launch_is_not_reused() {
    let h = harness(1);
    let module = h.context.create_module(format!("{SOURCE}\n.visible .entry __bounds__unregistered(\n)\n"));
    let ty = h.context.create_user_geom_type(16, sphere_vars()).unwrap();
    ty.set_bounds(ProgramDesc::new(&module, "__bounds__unregistered")).unwrap();
    let geom = h.context.create_geom(&ty);
    geom.set_prim_count(3).unwrap();

    for _ in 0..2 {
        match geom.compute_bounds() {
            Err(Error::Device { source }) => assert!(source.to_string().contains("__bounds__unregistered")),
            other => panic!("expected a device error, got {other:?}"),
        }
    }
    assert!(geom.bounds_buffer(0).unwrap().is_none());
}

#[test]
fn test_bounds_ignore_unrelated_failures() {
    let h = harness(1);
    let module = h.context.create_module(format!("{SOURCE}\n.visible .entry __bounds__unregistered(\n)\n"));
    let broken_ty = h.context.create_user_geom_type(16, sphere_vars()).unwrap();
    broken_ty.set_bounds(ProgramDesc::new(&module, "__bounds__unregistered")).unwrap();
    let broken = h.context.create_geom(&broken_ty);
    broken.set_prim_count(2).unwrap();
    broken.execute_bounds_prog(0).unwrap();

    let geom = h.context.create_geom(&h.sphere_type(&module));
    geom.set("radius", 1.0f32).unwrap();
    geom.set_prim_count(2).unwrap();
    assert_eq!(geom.compute_bounds().unwrap(), Aabb::new([-1.0, -1.0, -1.0], [2.0, 1.0, 1.0]));

    // The failure stays with whoever synchronizes next.
    assert!(matches!(h.context.synchronize(), Err(Error::Device { .. })));
    assert!(matches!(broken.compute_bounds(), Err(Error::Device { .. })));
}

#[test]
fn test_huge_prim_count_is_rejected() {
    let h = harness(1);
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));

    geom.set_prim_count(usize::MAX / 2).unwrap();
    assert!(matches!(
        geom.compute_bounds(),
        Err(Error::ResourceExhausted { device: 0, requested: usize::MAX, .. })
    ));

    geom.set_prim_count((1 << 30) / Aabb::BYTES + 1).unwrap();
    assert!(matches!(
        geom.execute_bounds_prog(0),
        Err(Error::ResourceExhausted { device: 0, available, .. }) if available == 1 << 30
    ));
    assert_eq!(h.live_buffers(0), 1);
    assert_eq!(h.stats(0).bounds_launches, 0);
}

#[test]
fn test_ray_type_out_of_range() {
    let h = harness(1);
    let module = h.module();
    let ty = h.sphere_type(&module);
    let err = ty.set_closest_hit(1, ProgramDesc::new(&module, "__closesthit__shade")).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { what: "ray type", index: 1, count: 1 }));
}

#[test]
fn test_one_hit_record_per_ray_type() {
    let h = harness_with(
        HostPlatformConfig::builder().device_count(1).build(),
        ContextConfig::builder().devices(GpuSelection::All).ray_types(2).build(),
    )
    .unwrap();
    let module = h.module();
    let geom = h.context.create_geom(&h.sphere_type(&module));
    geom.set("radius", 3.0f32).unwrap();
    geom.build().unwrap();

    let record = geom.record_bytes(0).unwrap();
    assert_eq!(record.len(), 2 * (32 + 16));
    let (first, second) = record.split_at(32 + 16);
    let (header0, payload0) = split_record(first);
    let (header1, payload1) = split_record(second);
    assert_ne!(header0, header1);
    assert_eq!(payload0, geom.variables().bytes());
    assert_eq!(payload1, geom.variables().bytes());
}

#[test]
fn test_program_change_invalidates_hit_groups() {
    let h = harness(1);
    let module = h.module();
    let ty = h.sphere_type(&module);
    let geom = h.context.create_geom(&ty);
    geom.build().unwrap();
    let before = ty.hit_groups(0).unwrap();
    assert!(geom.is_record_current(0).unwrap());

    ty.set_any_hit(0, ProgramDesc::new(&module, "__anyhit__shadow")).unwrap();
    assert!(ty.hit_groups(0).is_none());
    assert!(!geom.is_record_current(0).unwrap());

    h.context.build_sbt().unwrap();
    assert_ne!(ty.hit_groups(0).unwrap(), before);
    assert!(geom.is_record_current(0).unwrap());
    assert_eq!(h.stats(0).live_program_groups, 1);
}

#[test]
fn test_unknown_entry_fails_to_build() {
    let h = harness(1);
    let module = h.module();
    let ty = h.context.create_user_geom_type(0, vec![]).unwrap();
    ty.set_closest_hit(0, ProgramDesc::new(&module, "__closesthit__missing")).unwrap();
    let geom = h.context.create_geom(&ty);

    assert!(matches!(geom.build(), Err(Error::Compilation { ref log, .. }) if log.contains("__closesthit__missing")));
    assert_eq!(h.stats(0).live_program_groups, 0);
}
