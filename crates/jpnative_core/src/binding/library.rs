//! Symbol sources: where entry addresses come from.
//!
//! # Responsibility
//! - Open artifacts with the platform dynamic loader.
//! - Offer an in-process symbol table for statically linked natives.
//!
//! # Invariants
//! - An address returned by a source stays valid while the source is alive.
//! - A null address is never returned; it counts as "not found".

use crate::binding::BindError;
use crate::build::ArtifactHandle;
use libloading::{Library, Symbol};
use log::{debug, info};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves native entry symbols to addresses.
pub trait SymbolSource: Send + Sync + Debug {
    fn resolve(&self, symbol: &str) -> Option<*const c_void>;

    /// Files backing this source, for diagnostics.
    fn paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Turns an artifact into a symbol source.
pub trait ArtifactOpener: Send + Sync + Debug {
    fn open(&self, artifact: &ArtifactHandle) -> Result<Arc<dyn SymbolSource>, BindError>;
}

/// Opener backed by the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryOpener;

impl ArtifactOpener for LibraryOpener {
    fn open(&self, artifact: &ArtifactHandle) -> Result<Arc<dyn SymbolSource>, BindError> {
        Ok(Arc::new(DynamicLibrary::open(artifact)?))
    }
}

/// Shared libraries of one artifact, searched in load order.
#[derive(Debug)]
pub struct DynamicLibrary {
    libraries: Vec<(PathBuf, Library)>,
}

impl DynamicLibrary {
    /// Loads every loadable library of `artifact`.
    ///
    /// # Errors
    /// - `ArtifactLoad` when the artifact has no loadable library or one fails to load.
    pub fn open(artifact: &ArtifactHandle) -> Result<Self, BindError> {
        let paths = artifact.loadable_libraries();
        if paths.is_empty() {
            return Err(BindError::ArtifactLoad {
                path: artifact
                    .files()
                    .first()
                    .map(|path| path.to_path_buf())
                    .unwrap_or_default(),
                reason: "artifact contains no loadable library".to_string(),
            });
        }
        let libraries = paths
            .into_iter()
            .map(|path| open_library(path).map(|library| (path.to_path_buf(), library)))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "event=artifact_open module=binding status=ok name={} libraries={}",
            artifact.module_name,
            libraries.len()
        );
        Ok(Self { libraries })
    }
}

fn open_library(path: &Path) -> Result<Library, BindError> {
    // SAFETY: loading runs the library's static initializers. Artifacts are
    // produced by the build driver or shipped with the module being loaded.
    unsafe { Library::new(path) }.map_err(|err| BindError::ArtifactLoad {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

impl SymbolSource for DynamicLibrary {
    fn resolve(&self, symbol: &str) -> Option<*const c_void> {
        self.libraries.iter().find_map(|(path, library)| {
            // SAFETY: the symbol is only read as an address, never called here.
            let found: Result<Symbol<'_, *const c_void>, _> =
                unsafe { library.get(symbol.as_bytes()) };
            match found {
                Ok(address) if !address.is_null() => Some(*address),
                Ok(_) => None,
                Err(err) => {
                    debug!(
                        "event=symbol_lookup module=binding status=miss symbol={symbol} library={} reason={err}",
                        path.display()
                    );
                    None
                }
            }
        })
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.libraries.iter().map(|(path, _)| path.clone()).collect()
    }
}

/// In-process symbol table.
///
/// Serves natives linked into the host binary, and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticSymbols {
    symbols: BTreeMap<String, usize>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` under `symbol`, replacing an earlier entry.
    pub fn with(mut self, symbol: impl Into<String>, address: *const c_void) -> Self {
        self.insert(symbol, address);
        self
    }

    pub fn insert(&mut self, symbol: impl Into<String>, address: *const c_void) {
        self.symbols.insert(symbol.into(), address as usize);
    }
}

impl SymbolSource for StaticSymbols {
    fn resolve(&self, symbol: &str) -> Option<*const c_void> {
        self.symbols
            .get(symbol)
            .filter(|address| **address != 0)
            .map(|address| *address as *const c_void)
    }
}

/// Opener that hands every artifact the same symbol source.
#[derive(Debug, Clone)]
pub struct FixedOpener {
    source: Arc<dyn SymbolSource>,
}

impl FixedOpener {
    pub fn new(source: Arc<dyn SymbolSource>) -> Self {
        Self { source }
    }
}

impl ArtifactOpener for FixedOpener {
    fn open(&self, _artifact: &ArtifactHandle) -> Result<Arc<dyn SymbolSource>, BindError> {
        Ok(Arc::clone(&self.source))
    }
}
