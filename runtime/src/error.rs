//! Error types for the object model.

use snafu::Snafu;
use strix_dtype::VarType;

use crate::object::ObjectId;
use crate::program::ProgramRole;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A device rejected a module or program; the object stays usable on other devices.
    #[snafu(display("compilation failed on device {device}: {log}"))]
    Compilation { device: usize, log: String },

    /// Index past the end of a fixed-size table (device slots, ray types).
    #[snafu(display("{what} {index} out of range ({count} slots)"))]
    OutOfRange { what: &'static str, index: usize, count: usize },

    #[snafu(display("operation `{operation}` is not implemented"))]
    UnimplementedOperation { operation: &'static str },

    #[snafu(display("resource exhausted on device {device}: requested {requested} bytes, {available} available"))]
    ResourceExhausted { device: usize, requested: usize, available: usize },

    /// Per-device state was never created for this slot.
    #[snafu(display("{object} has no state on device {ordinal}"))]
    DeviceDataMissing { object: ObjectId, ordinal: usize },

    /// The device in this slot was removed from the context.
    #[snafu(display("device {ordinal} was removed from the context"))]
    DeviceRetired { ordinal: usize },

    /// Record bytes do not match the size fixed at allocation.
    #[snafu(display("SBT record size mismatch: expected {expected} bytes, got {actual}"))]
    RecordSizeMismatch { expected: usize, actual: usize },

    #[snafu(display("unknown variable `{name}`"))]
    UnknownVariable { name: String },

    #[snafu(display("variable `{name}` is {expected} bytes, got {actual}"))]
    VariableSizeMismatch { name: String, expected: usize, actual: usize },

    #[snafu(display("variable `{name}` is declared {expected}, got a {actual} value"))]
    VariableTypeMismatch { name: String, expected: VarType, actual: VarType },

    #[snafu(display("invalid variable layout: {reason}"))]
    InvalidLayout { reason: String },

    #[snafu(display("no {role} program"))]
    MissingProgram { role: ProgramRole },

    #[snafu(display("{object} is not user geometry"))]
    NotUserGeometry { object: ObjectId },

    #[snafu(display("invalid launch dimensions {dims:?}"))]
    InvalidLaunchDims { dims: [u32; 2] },

    #[snafu(display("no viable devices: {reason}"))]
    NoViableDevices { reason: String },

    #[snafu(display("{object} outlived its context"))]
    ContextDropped { object: ObjectId },

    #[snafu(display("device error: {source}"))]
    Device { source: strix_device::Error },
}

impl From<strix_device::Error> for Error {
    fn from(source: strix_device::Error) -> Self {
        match source {
            strix_device::Error::Compilation { device, log } => Error::Compilation { device, log },
            strix_device::Error::ResourceExhausted { device, requested, available } => {
                Error::ResourceExhausted { device, requested, available }
            }
            source => Error::Device { source },
        }
    }
}
