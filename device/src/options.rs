//! Module compile options shared by every device of a context.

/// Backend optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    #[default]
    O3,
}

/// Amount of debug information emitted into compiled modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DebugLevel {
    None,
    #[default]
    Minimal,
    Moderate,
    Full,
}

/// Options passed to [`Backend::compile`](crate::Backend::compile).
#[derive(Debug, Clone, PartialEq, Eq, Hash, bon::Builder)]
pub struct CompileOptions {
    #[builder(default)]
    pub opt_level: OptLevel,
    #[builder(default)]
    pub debug_level: DebugLevel,
    /// Maximum recursion depth of `trace` calls in the pipeline.
    #[builder(default = 2)]
    pub max_trace_depth: u32,
    /// Name of the launch-params global in compiled modules.
    #[builder(default = String::from("launchParams"), into)]
    pub launch_params_name: String,
    #[builder(default = 2)]
    pub num_payload_values: u32,
    #[builder(default = 2)]
    pub num_attribute_values: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CompileOptions {
    /// Upper bound accepted by the pipeline for [`CompileOptions::max_trace_depth`].
    pub const MAX_TRACE_DEPTH_LIMIT: u32 = 31;
}
