use bytemuck::{NoUninit, Pod, Zeroable};

use super::*;

/// Rust value types that map onto a declared variable type.
pub trait HasVarType: NoUninit {
    const VAR_TYPE: VarType;

    fn var_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Device address stored in a `Buffer` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct DeviceAddress(pub u64);

macro_rules! impl_var_type_ext {
    ($($ty:ty => $var_type:expr),* $(,)?) => {
        $(impl HasVarType for $ty { const VAR_TYPE: VarType = $var_type; })*
    };
}

impl_var_type_ext! {
    bool => VarType::Scalar(ScalarType::Bool),
    i8 => VarType::Scalar(ScalarType::Int8), i16 => VarType::Scalar(ScalarType::Int16),
    i32 => VarType::Scalar(ScalarType::Int32), i64 => VarType::Scalar(ScalarType::Int64),
    u8 => VarType::Scalar(ScalarType::UInt8), u16 => VarType::Scalar(ScalarType::UInt16),
    u32 => VarType::Scalar(ScalarType::UInt32), u64 => VarType::Scalar(ScalarType::UInt64),
    f32 => VarType::FLOAT, f64 => VarType::Scalar(ScalarType::Float64),
    [f32; 2] => VarType::FLOAT2, [f32; 3] => VarType::FLOAT3, [f32; 4] => VarType::FLOAT4,
    [i32; 2] => VarType::INT2, [i32; 3] => VarType::INT3,
    [i32; 4] => VarType::Vector { scalar: ScalarType::Int32, count: 4 },
    [u32; 2] => VarType::Vector { scalar: ScalarType::UInt32, count: 2 },
    [u32; 3] => VarType::Vector { scalar: ScalarType::UInt32, count: 3 },
    [u32; 4] => VarType::Vector { scalar: ScalarType::UInt32, count: 4 },
    DeviceAddress => VarType::Buffer,
}
