use bytemuck::{Pod, Zeroable};

/// Axis-aligned box as written by bounds kernels (`box3f` layout: min then max).
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const BYTES: usize = std::mem::size_of::<Aabb>();

    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// The identity for [`Aabb::union`]: contains nothing.
    pub const fn empty() -> Self {
        Self { min: [f32::INFINITY; 3], max: [f32::NEG_INFINITY; 3] }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.min[axis] > self.max[axis])
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        let mut out = *self;
        for axis in 0..3 {
            out.min[axis] = out.min[axis].min(other.min[axis]);
            out.max[axis] = out.max[axis].max(other.max[axis]);
        }
        out
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        other.is_empty() || (0..3).all(|axis| self.min[axis] <= other.min[axis] && other.max[axis] <= self.max[axis])
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}
