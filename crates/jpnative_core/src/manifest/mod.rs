//! Native module manifest contracts.
//!
//! # Responsibility
//! - Define the typed `module.json` model.
//! - Parse and validate manifest documents before anything is built.
//!
//! # Invariants
//! - Parsing is pure and never partially succeeds.
//! - The model is immutable once returned by the loader.

pub mod loader;
pub mod model;

pub use loader::{load, load_file, ManifestError};
pub use model::{
    BundleInfo, FunctionSpec, ModuleEntrypoints, ModuleManifest, ModuleVersion, ParamSpec,
    ReturnSpec, SemanticType,
};
