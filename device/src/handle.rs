//! Opaque backend handles.
//!
//! Handles are plain ids minted by a backend. They are only meaningful to the
//! backend that created them and are never reused for a different object.

macro_rules! backend_handle {
    ($($(#[$meta:meta])* $name:ident => $label:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const KIND: &'static str = $label;

                pub const fn raw(&self) -> u64 {
                    self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}#{}", $label, self.0)
                }
            }
        )*
    };
}

backend_handle! {
    /// Compiled module on one device.
    ModuleHandle => "module",
    /// Pipeline program group on one device.
    ProgramGroupHandle => "program group",
    /// Directly launchable kernel (bounds programs).
    KernelHandle => "kernel",
}
