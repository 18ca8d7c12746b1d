//! Registered-object model for multi-device ray-tracing scene graphs.
//!
//! A [`Context`] owns a set of devices. Everything created through it (modules,
//! ray-generation and geometry types, their instances, launch parameters) is a
//! registered object that keeps independent, lazily created state on every
//! device:
//!
//! - [`Module`]: compiled handle per device, recompiled on demand
//! - [`RayGenType`] / [`GeomType`]: program groups per device, rebuilt when a module is recompiled
//! - [`RayGen`] / [`Geom`]: SBT record buffer per device, rewritten when variables or program groups change
//! - [`LaunchParams`]: parameter buffer per device
//!
//! Per-device state lives in a [`DeviceDataRegistry`] indexed by device ordinal.
//! Removing a device tombstones its slot in every registry and releases the
//! state it held.

pub mod config;
pub mod context;
pub mod error;
pub mod geom;
pub mod launch_params;
pub mod layout;
pub mod module;
pub mod object;
pub mod program;
pub mod raygen;
pub mod registry;
pub mod sbt;

#[cfg(test)]
pub mod test;

pub use config::{ContextConfig, GpuSelection};
pub use context::Context;
pub use error::*;
pub use geom::{Geom, GeomKind, GeomType};
pub use launch_params::LaunchParams;
pub use layout::{HasVariables, InstanceVariables, VariableLayout};
pub use module::{CompiledModule, Module};
pub use object::{ObjectId, ObjectKind, RegisteredObject};
pub use program::{ProgramDesc, ProgramRole};
pub use raygen::{RayGen, RayGenType};
pub use registry::DeviceDataRegistry;
pub use sbt::RecordStamp;
