//! Process-wide table of loaded modules.
//!
//! # Responsibility
//! - Own every loaded module (bindings plus artifact) under its name.
//! - Serialize loads of one name; let different names proceed in parallel.
//! - Tear everything down at process shutdown.
//!
//! # Invariants
//! - At most one module per name; a second registration is `AlreadyLoaded`.
//! - A module becomes visible only after its `init` entrypoint ran.
//! - Entries are removed only by `unload_all`, which waits for in-flight
//!   loads and then closes the registry for good.

use crate::binding::{BoundFunction, FunctionTable};
use crate::build::ArtifactHandle;
use crate::gate::{GateGuard, KeyedGate};
use crate::manifest::ModuleManifest;
use crate::platform::Platform;
use log::info;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static GLOBAL_REGISTRY: Lazy<Arc<ModuleRegistry>> = Lazy::new(|| Arc::new(ModuleRegistry::new()));

/// Shared registry for the whole process.
pub fn global() -> Arc<ModuleRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

/// One successfully loaded module.
#[derive(Debug)]
pub struct LoadedModule {
    pub manifest: ModuleManifest,
    /// Platform the module was built for.
    pub platform: Platform,
    /// `None` for modules without native code.
    pub artifact: Option<ArtifactHandle>,
    pub functions: FunctionTable,
}

impl LoadedModule {
    pub fn new(
        manifest: ModuleManifest,
        platform: Platform,
        artifact: Option<ArtifactHandle>,
        functions: FunctionTable,
    ) -> Self {
        Self {
            manifest,
            platform,
            artifact,
            functions,
        }
    }

    /// Module without native code: nothing to build or bind.
    pub fn script_only(manifest: ModuleManifest, platform: Platform) -> Self {
        Self::new(manifest, platform, None, FunctionTable::empty())
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn function(&self, name: &str) -> Option<&BoundFunction> {
        self.functions.get(name)
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.manifest.name.clone(),
            version: self.manifest.version.to_string(),
            description: self.manifest.description.clone(),
            native: self.manifest.native,
            bundled: self.manifest.bundled,
            platform: self.platform,
            artifact_paths: self
                .artifact
                .as_ref()
                .map(|artifact| {
                    artifact
                        .files()
                        .into_iter()
                        .map(|path| path.to_path_buf())
                        .collect()
                })
                .unwrap_or_default(),
            functions: self
                .manifest
                .functions
                .iter()
                .map(|(name, spec)| spec.signature(name))
                .collect(),
        }
    }
}

/// Read-only summary backing the `list`/`info` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub native: bool,
    pub bundled: bool,
    pub platform: Platform,
    pub artifact_paths: Vec<PathBuf>,
    /// Declared signatures in script-name order.
    pub functions: Vec<String>,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyLoaded(String),
    NotFound(String),
    /// `unload_all` ran; the registry accepts no further modules.
    ShuttingDown(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyLoaded(name) => write!(f, "module already loaded: {name}"),
            Self::NotFound(name) => write!(f, "module not loaded: {name}"),
            Self::ShuttingDown(name) => {
                write!(f, "module registry is shut down; cannot load {name}")
            }
        }
    }
}

impl Error for RegistryError {}

/// Loaded modules keyed by name.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<String, Arc<LoadedModule>>>,
    loading: KeyedGate,
    closed: AtomicBool,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name` for one in-flight load.
    ///
    /// Blocks while another caller holds a reservation for `name`. Dropping
    /// the reservation without committing leaves the registry unchanged.
    ///
    /// # Errors
    /// - `ShuttingDown` once `unload_all` has started.
    /// - `AlreadyLoaded` when `name` is registered (possibly by the caller we waited for).
    pub fn reserve(&self, name: &str) -> Result<Reservation<'_>, RegistryError> {
        self.ensure_open(name)?;
        let guard = self.loading.enter(name);
        self.ensure_open(name)?;
        if self.read().contains_key(name) {
            return Err(RegistryError::AlreadyLoaded(name.to_string()));
        }
        Ok(Reservation {
            registry: self,
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Registers `module` under its manifest name.
    pub fn register(&self, module: LoadedModule) -> Result<Arc<LoadedModule>, RegistryError> {
        let name = module.name().to_string();
        self.reserve(&name)?.commit(module)
    }

    /// # Errors
    /// - `NotFound` when no module named `name` is loaded.
    pub fn lookup(&self, name: &str) -> Result<Arc<LoadedModule>, RegistryError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Loaded module names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn info(&self, name: &str) -> Result<ModuleInfo, RegistryError> {
        self.lookup(name).map(|module| module.info())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether `unload_all` has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Teardown barrier: closes the registry, waits for in-flight loads to
    /// commit or abandon, then runs every `dispose` entrypoint and drops all modules.
    ///
    /// Returns how many modules were unloaded. Libraries stay mapped while a
    /// caller still holds an `Arc<LoadedModule>`. Must not be called while the
    /// calling thread holds a `Reservation`.
    pub fn unload_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.loading.wait_until_idle();

        let modules = std::mem::take(&mut *self.write());
        let count = modules.len();
        for (name, module) in modules.into_iter().rev() {
            module.functions.run_dispose();
            info!("event=module_unload module=registry status=ok name={name}");
        }
        count
    }

    fn ensure_open(&self, name: &str) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::ShuttingDown(name.to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<LoadedModule>>> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<LoadedModule>>> {
        self.modules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to register one module name.
#[derive(Debug)]
pub struct Reservation<'a> {
    registry: &'a ModuleRegistry,
    name: String,
    _guard: GateGuard<'a>,
}

impl Reservation<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the module's `init` entrypoint, then publishes it.
    ///
    /// Refusals happen before `init`, so a refused module never needs `dispose`.
    /// While the reservation is held, `unload_all` cannot drain, so a module
    /// committed here is always disposed by a later teardown.
    ///
    /// # Errors
    /// - `ShuttingDown` when `unload_all` started after the reservation was taken.
    pub fn commit(self, module: LoadedModule) -> Result<Arc<LoadedModule>, RegistryError> {
        self.registry.ensure_open(&self.name)?;
        if self.registry.contains(&self.name) {
            return Err(RegistryError::AlreadyLoaded(self.name.clone()));
        }

        module.functions.run_init();
        let module = Arc::new(module);
        self.registry
            .write()
            .insert(self.name.clone(), Arc::clone(&module));

        info!(
            "event=module_register module=registry status=ok name={} functions={}",
            self.name,
            module.functions.len()
        );
        Ok(module)
    }
}
