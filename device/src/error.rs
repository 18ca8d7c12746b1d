use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Backend rejected a program source; `log` carries its diagnostics.
    #[snafu(display("compilation failed on device {device}: {log}"))]
    Compilation { device: usize, log: String },

    /// Device memory budget exhausted.
    #[snafu(display("resource exhausted on device {device}: requested {requested} bytes, {available} available"))]
    ResourceExhausted { device: usize, requested: usize, available: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Handle unknown to the backend (already destroyed, or from another device).
    #[snafu(display("unknown {kind} handle {handle} on device {device}"))]
    InvalidHandle { kind: &'static str, handle: u64, device: usize },

    /// Physical device could not be opened.
    #[snafu(display("device {index} unavailable: {reason}"))]
    DeviceUnavailable { index: usize, reason: String },

    /// Work failed while executing on a queue.
    #[snafu(display("execution failed on device {device}: {reason}"))]
    Execution { device: usize, reason: String },

    #[snafu(display("execution queue of device {device} is closed"))]
    QueueClosed { device: usize },

    #[snafu(display("timeline signal timeout: waited {timeout_ms}ms for value {target}, current {current}"))]
    Timeout { target: u64, current: u64, timeout_ms: u64 },
}
