//! Context configuration.
//!
//! Typed configuration with bon builders and environment fallbacks.

use strix_device::CompileOptions;

/// Which devices a context opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GpuSelection {
    /// The first device that opens.
    #[default]
    First,

    /// The first device with ray-tracing cores, else the first device.
    FirstPreferRtx,

    /// The device with ray-tracing cores and the most memory.
    Best,

    /// Every device, in multi-device mode.
    All,

    /// Every device with ray-tracing cores.
    AllRtx,

    /// These platform indices. Invalid ones are skipped with a warning.
    Explicit(Vec<usize>),
}

impl GpuSelection {
    /// Parse `first`, `first-rtx`, `best`, `all`, `all-rtx` or a comma-separated index list.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Some(Self::First),
            "first-rtx" => Some(Self::FirstPreferRtx),
            "best" => Some(Self::Best),
            "all" => Some(Self::All),
            "all-rtx" => Some(Self::AllRtx),
            list => {
                let indices: Option<Vec<usize>> = list.split(',').map(|item| item.trim().parse().ok()).collect();
                indices.filter(|indices| !indices.is_empty()).map(Self::Explicit)
            }
        }
    }
}

/// Configuration of a [`Context`](crate::Context).
#[derive(Debug, Clone, bon::Builder)]
pub struct ContextConfig {
    #[builder(default)]
    pub devices: GpuSelection,

    /// Number of ray types; every geometry carries one hit record per ray type.
    #[builder(default = 1)]
    pub ray_types: usize,

    #[builder(default)]
    pub compile_options: CompileOptions,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ContextConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `STRIX_DEVICES` - Device selection, see [`GpuSelection::parse`] (default: `first`)
    /// * `STRIX_RAY_TYPES` - Number of ray types, at least 1 (default: 1)
    pub fn from_env() -> Self {
        let devices = match std::env::var("STRIX_DEVICES") {
            Ok(value) => GpuSelection::parse(&value).unwrap_or_else(|| {
                tracing::warn!(%value, "unrecognized STRIX_DEVICES, using the first device");
                GpuSelection::default()
            }),
            Err(_) => GpuSelection::default(),
        };
        let ray_types = std::env::var("STRIX_RAY_TYPES")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|count: &usize| *count > 0)
            .unwrap_or(1);

        Self::builder().devices(devices).ray_types(ray_types).build()
    }
}
