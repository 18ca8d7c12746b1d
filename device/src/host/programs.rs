//! Rust closures standing in for device programs.
//!
//! The host backend cannot run PTX. Instead, every entry symbol that should do
//! something when launched is bound to a closure here. Modules still have to
//! export the symbol with an `.entry` directive for program groups and kernels
//! to resolve it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::geometry::Aabb;

/// One ray-generation thread.
#[derive(Debug)]
pub struct RayGenInvocation<'a> {
    pub pixel: [u32; 2],
    pub dims: [u32; 2],
    /// Platform index of the device running the launch.
    pub device: usize,
    /// Payload of the SBT record, header stripped.
    pub record_data: &'a [u8],
    pub params: Option<&'a [u8]>,
}

/// One bounds-kernel thread.
#[derive(Debug)]
pub struct BoundsInvocation<'a> {
    pub prim_id: usize,
    pub device: usize,
    pub geom_data: &'a [u8],
}

pub type RayGenFn = Arc<dyn Fn(&RayGenInvocation<'_>) + Send + Sync>;
pub type BoundsFn = Arc<dyn Fn(&BoundsInvocation<'_>) -> Aabb + Send + Sync>;

#[derive(Clone)]
enum HostProgram {
    RayGen(RayGenFn),
    Bounds(BoundsFn),
}

/// Symbol table shared by every device of a host platform.
#[derive(Default)]
pub struct HostPrograms {
    programs: RwLock<HashMap<String, HostProgram>>,
}

impl HostPrograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_raygen<F>(&self, symbol: impl Into<String>, program: F)
    where
        F: Fn(&RayGenInvocation<'_>) + Send + Sync + 'static,
    {
        self.programs.write().insert(symbol.into(), HostProgram::RayGen(Arc::new(program)));
    }

    pub fn register_bounds<F>(&self, symbol: impl Into<String>, program: F)
    where
        F: Fn(&BoundsInvocation<'_>) -> Aabb + Send + Sync + 'static,
    {
        self.programs.write().insert(symbol.into(), HostProgram::Bounds(Arc::new(program)));
    }

    pub fn raygen(&self, symbol: &str) -> Option<RayGenFn> {
        match self.programs.read().get(symbol)? {
            HostProgram::RayGen(program) => Some(Arc::clone(program)),
            HostProgram::Bounds(_) => None,
        }
    }

    pub fn bounds(&self, symbol: &str) -> Option<BoundsFn> {
        match self.programs.read().get(symbol)? {
            HostProgram::Bounds(program) => Some(Arc::clone(program)),
            HostProgram::RayGen(_) => None,
        }
    }
}

impl std::fmt::Debug for HostPrograms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let programs = self.programs.read();
        let mut symbols: Vec<_> = programs.keys().collect();
        symbols.sort();
        f.debug_struct("HostPrograms").field("symbols", &symbols).finish()
    }
}
