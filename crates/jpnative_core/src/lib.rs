//! Native extension loader for JP.
//!
//! Parses `module.json` manifests, builds (or adopts) native code per
//! platform, binds declared functions to native symbols and keeps the
//! process-wide registry of loaded modules.

pub mod binding;
pub mod build;
pub mod cancel;
pub mod config;
pub mod db;
pub mod gate;
pub mod logging;
pub mod manifest;
pub mod platform;
pub mod registry;
pub mod service;

pub use binding::{
    bind, bind_symbols, bind_with, ArtifactOpener, BindError, BoundFunction, CallError,
    FunctionTable, LibraryOpener, NativeHandle, ScriptValue, StaticSymbols, SymbolSource,
};
pub use build::{
    ArtifactHandle, ArtifactKind, BuildCache, BuildDriver, BuildError, BuildResult, Toolchain,
};
pub use cancel::CancellationToken;
pub use config::{ConfigError, LoaderConfig};
pub use logging::{
    default_log_level, init_logging, init_logging_for, log_level_from_env, logging_status,
};
pub use manifest::{
    load, load_file, FunctionSpec, ManifestError, ModuleManifest, ModuleVersion, SemanticType,
};
pub use platform::Platform;
pub use registry::{LoadedModule, ModuleInfo, ModuleRegistry, RegistryError};
pub use service::load_service::{LoadError, LoadResult, LoadTask, ModuleLoadService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
