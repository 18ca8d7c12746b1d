//! Identity shared by every registered object.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Process-unique object id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter, strum::EnumCount)]
#[strum(serialize_all = "snake_case")]
pub enum ObjectKind {
    Module,
    RayGenType,
    GeomType,
    RayGen,
    Geom,
    LaunchParams,
}

impl ObjectKind {
    /// Position in dependency order: modules first, instances last.
    ///
    /// Programs are rebuilt in ascending order and per-device state is torn
    /// down in descending order.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Module => 0,
            Self::RayGenType | Self::GeomType => 1,
            Self::RayGen | Self::Geom | Self::LaunchParams => 2,
        }
    }
}

/// An object whose per-device state follows the context's device set.
pub trait RegisteredObject: Send + Sync + std::fmt::Debug {
    fn id(&self) -> ObjectId;

    fn kind(&self) -> ObjectKind;

    /// Extend per-device slots to `slots`. New slots start vacant.
    fn grow_devices(&self, slots: usize);

    /// Drop the state held for a removed device and tombstone its slot.
    fn retire_device(&self, ordinal: usize) -> Result<()>;

    /// Recompile or rebuild program state on the given devices.
    fn rebuild_programs(&self, _ordinals: &[usize]) -> Result<()> {
        Ok(())
    }

    /// Rewrite stale SBT records on the given devices.
    fn refresh_records(&self, _ordinals: &[usize]) -> Result<()> {
        Ok(())
    }
}
