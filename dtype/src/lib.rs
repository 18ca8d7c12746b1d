//! Variable types for per-object shader data.
//!
//! Every registered object exposes its instance data to device programs as a
//! plain struct. The types here describe the fields of that struct so the
//! runtime can validate writes and lay out SBT record payloads byte-for-byte.

pub mod decl;
pub mod ext;


pub use decl::VarDecl;
pub use ext::{DeviceAddress, HasVarType};

/// Scalar field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl ScalarType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn c_style(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8_t",
            Self::UInt8 => "uint8_t",
            Self::Int16 => "int16_t",
            Self::UInt16 => "uint16_t",
            Self::Int32 => "int32_t",
            Self::UInt32 => "uint32_t",
            Self::Int64 => "int64_t",
            Self::UInt64 => "uint64_t",
            Self::Float32 => "float",
            Self::Float64 => "double",
        }
    }
}

/// Type of a single declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    /// Single scalar value.
    Scalar(ScalarType),

    /// Short vector (`float3`, `int2`, ...). `count` is 2, 3 or 4.
    Vector { scalar: ScalarType, count: usize },

    /// 64-bit address of a device buffer.
    Buffer,

    /// Opaque user struct of a fixed size.
    Raw { size: usize },
}

impl VarType {
    /// Create a vector type. A count of one collapses to the scalar.
    pub fn vector(scalar: ScalarType, count: usize) -> Self {
        assert!((1..=4).contains(&count), "vector count must be in 1..=4, got {count}");
        if count == 1 { Self::Scalar(scalar) } else { Self::Vector { scalar, count } }
    }

    pub const fn raw(size: usize) -> Self {
        Self::Raw { size }
    }

    pub const fn bytes(&self) -> usize {
        match self {
            Self::Scalar(s) => s.bytes(),
            Self::Vector { scalar, count } => scalar.bytes() * *count,
            Self::Buffer => 8,
            Self::Raw { size } => *size,
        }
    }

    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(s) | Self::Vector { scalar: s, .. } => Some(*s),
            Self::Buffer | Self::Raw { .. } => None,
        }
    }

    /// Whether a value of type `value` may be stored in a field of this type.
    ///
    /// Raw fields accept any value of matching size; every other type must match exactly.
    pub fn accepts(&self, value: &VarType) -> bool {
        match self {
            Self::Raw { size } => *size == value.bytes(),
            _ => self == value,
        }
    }

    pub fn c_style(&self) -> String {
        match self {
            Self::Scalar(s) => s.c_style().to_string(),
            Self::Vector { scalar, count } => format!("{}[{}]", scalar.c_style(), count),
            Self::Buffer => "void*".to_string(),
            Self::Raw { size } => format!("uint8_t[{size}]"),
        }
    }
}

impl From<ScalarType> for VarType {
    fn from(scalar: ScalarType) -> Self {
        Self::Scalar(scalar)
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Vector { scalar, count } => write!(f, "{scalar}{count}"),
            Self::Buffer => f.write_str("buffer"),
            Self::Raw { size } => write!(f, "raw[{size}]"),
        }
    }
}

// Shorthands for the common field types
impl VarType {
    pub const INT: Self = Self::Scalar(ScalarType::Int32);
    pub const UINT: Self = Self::Scalar(ScalarType::UInt32);
    pub const FLOAT: Self = Self::Scalar(ScalarType::Float32);
    pub const FLOAT2: Self = Self::Vector { scalar: ScalarType::Float32, count: 2 };
    pub const FLOAT3: Self = Self::Vector { scalar: ScalarType::Float32, count: 3 };
    pub const FLOAT4: Self = Self::Vector { scalar: ScalarType::Float32, count: 4 };
    pub const INT2: Self = Self::Vector { scalar: ScalarType::Int32, count: 2 };
    pub const INT3: Self = Self::Vector { scalar: ScalarType::Int32, count: 3 };
}
