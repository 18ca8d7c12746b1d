use std::sync::Arc;

use strix_device::EntryPoint;

use crate::error::Result;
use crate::module::{CompiledModule, Module};

/// What a program does in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ProgramRole {
    RayGen,
    ClosestHit,
    AnyHit,
    Intersection,
    /// Directly launched kernel computing primitive bounds; not part of any program group.
    Bounds,
}

/// A named entry point of a module.
#[derive(Debug, Clone)]
pub struct ProgramDesc {
    pub module: Arc<Module>,
    pub entry: String,
}

impl ProgramDesc {
    pub fn new(module: &Arc<Module>, entry: impl Into<String>) -> Self {
        Self { module: Arc::clone(module), entry: entry.into() }
    }

    /// Entry point on device `ordinal`, compiling the module there if needed.
    pub(crate) fn resolve(&self, ordinal: usize) -> Result<(EntryPoint, CompiledModule)> {
        let compiled = self.module.ensure_created(ordinal)?;
        Ok((EntryPoint::new(compiled.handle, self.entry.clone()), compiled))
    }
}
