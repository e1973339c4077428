//! Module load use-case service.
//!
//! # Responsibility
//! - Drive one load end to end: manifest, build, open, bind, register.
//! - Run loads on a background worker that callers can wait on or cancel.
//!
//! # Invariants
//! - Any failure or cancellation leaves the registry as if the load never started.
//! - Modules without native code never reach the build driver.
//! - A compiled artifact stays cached only if binding it succeeded.
//! - Loads of one name are serialized through the registry reservation.

use crate::binding::{bind_with, ArtifactOpener, BindError, LibraryOpener};
use crate::build::{BuildDriver, BuildError};
use crate::cancel::CancellationToken;
use crate::config::{ConfigError, LoaderConfig};
use crate::manifest::{self, ManifestError, ModuleManifest};
use crate::platform::Platform;
use crate::registry::{self, LoadedModule, ModuleRegistry, RegistryError};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub type LoadResult<T> = Result<T, LoadError>;

/// Any failure of a module load.
#[derive(Debug)]
pub enum LoadError {
    Config(ConfigError),
    Manifest(ManifestError),
    Build(BuildError),
    Bind(BindError),
    Registry(RegistryError),
    Cancelled,
    /// The background worker could not be started or panicked.
    Worker(String),
}

impl LoadError {
    /// `AlreadyLoaded` is not a failure of the module itself.
    pub fn is_already_loaded(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::AlreadyLoaded(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Manifest(err) => write!(f, "{err}"),
            Self::Build(err) => write!(f, "{err}"),
            Self::Bind(err) => write!(f, "{err}"),
            Self::Registry(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "module load cancelled"),
            Self::Worker(message) => write!(f, "load worker failed: {message}"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Manifest(err) => Some(err),
            Self::Build(err) => Some(err),
            Self::Bind(err) => Some(err),
            Self::Registry(err) => Some(err),
            Self::Cancelled | Self::Worker(_) => None,
        }
    }
}

impl From<ConfigError> for LoadError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<ManifestError> for LoadError {
    fn from(value: ManifestError) -> Self {
        Self::Manifest(value)
    }
}

impl From<BuildError> for LoadError {
    fn from(value: BuildError) -> Self {
        match value {
            BuildError::Cancelled => Self::Cancelled,
            other => Self::Build(other),
        }
    }
}

impl From<BindError> for LoadError {
    fn from(value: BindError) -> Self {
        Self::Bind(value)
    }
}

impl From<RegistryError> for LoadError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

/// Loads native modules into a registry.
///
/// Cheap to clone; clones share driver, opener and registry.
#[derive(Debug, Clone)]
pub struct ModuleLoadService {
    driver: Arc<BuildDriver>,
    opener: Arc<dyn ArtifactOpener>,
    registry: Arc<ModuleRegistry>,
}

impl ModuleLoadService {
    /// Service over the process-wide registry, opening artifacts with the
    /// platform loader.
    pub fn new(config: LoaderConfig) -> LoadResult<Self> {
        let driver = BuildDriver::new(config)?;
        Ok(Self::with_parts(
            Arc::new(driver),
            Arc::new(LibraryOpener),
            registry::global(),
        ))
    }

    /// Service built from the process environment (`LoaderConfig::from_env`).
    pub fn from_env() -> LoadResult<Self> {
        Self::new(LoaderConfig::from_env()?)
    }

    pub fn with_parts(
        driver: Arc<BuildDriver>,
        opener: Arc<dyn ArtifactOpener>,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        Self {
            driver,
            opener,
            registry,
        }
    }

    pub fn driver(&self) -> &BuildDriver {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Loads the module described by the manifest file at `path`.
    pub fn load_file(&self, path: impl AsRef<Path>) -> LoadResult<Arc<LoadedModule>> {
        let manifest = manifest::load_file(path)?;
        self.load_manifest(manifest)
    }

    pub fn load_manifest(&self, manifest: ModuleManifest) -> LoadResult<Arc<LoadedModule>> {
        self.load_manifest_with_cancel(manifest, &CancellationToken::new())
    }

    /// Loads `manifest`, checking `cancel` between steps and during the toolchain run.
    ///
    /// # Contract
    /// - Blocks while another load of the same name is in flight.
    /// - Returns `Registry(AlreadyLoaded)` when the name is already registered.
    /// - Registers nothing unless build, bind and `init` all completed.
    pub fn load_manifest_with_cancel(
        &self,
        manifest: ModuleManifest,
        cancel: &CancellationToken,
    ) -> LoadResult<Arc<LoadedModule>> {
        let started_at = Instant::now();
        let name = manifest.name.clone();
        let target = self.driver.config().target;
        info!(
            "event=module_load module=service status=start name={name} platform={target} native={}",
            manifest.native
        );

        let result = self.load_reserved(manifest, target, cancel);
        match &result {
            Ok(module) => info!(
                "event=module_load module=service status=ok name={name} functions={} duration_ms={}",
                module.functions.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) if err.is_already_loaded() => info!(
                "event=module_load module=service status=skipped name={name} reason=already_loaded"
            ),
            Err(err) => error!(
                "event=module_load module=service status=error name={name} duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    fn load_reserved(
        &self,
        manifest: ModuleManifest,
        target: Platform,
        cancel: &CancellationToken,
    ) -> LoadResult<Arc<LoadedModule>> {
        let reservation = self.registry.reserve(&manifest.name)?;
        if !manifest.requires_build() {
            return Ok(reservation.commit(LoadedModule::script_only(manifest, target))?);
        }

        check_cancel(cancel)?;
        let artifact = self.driver.build_with_cancel(&manifest, target, cancel)?;
        check_cancel(cancel)?;
        let functions = match bind_with(&manifest, &artifact, self.opener.as_ref()) {
            Ok(functions) => functions,
            Err(err) => {
                if let Err(discard_err) = self.driver.discard(&artifact) {
                    warn!(
                        "event=cache_discard module=service status=error name={} error={discard_err}",
                        manifest.name
                    );
                }
                return Err(err.into());
            }
        };
        check_cancel(cancel)?;

        Ok(reservation.commit(LoadedModule::new(
            manifest,
            target,
            Some(artifact),
            functions,
        ))?)
    }

    /// Starts loading `manifest` on a background worker.
    pub fn spawn_load(&self, manifest: ModuleManifest) -> LoadTask {
        let cancel = CancellationToken::new();
        let name = manifest.name.clone();
        let service = self.clone();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("jpnative-load-{name}"))
            .spawn(move || service.load_manifest_with_cancel(manifest, &worker_cancel));
        LoadTask {
            name,
            cancel,
            handle: handle.map_err(|err| err.to_string()),
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> LoadResult<()> {
    if cancel.is_cancelled() {
        Err(LoadError::Cancelled)
    } else {
        Ok(())
    }
}

/// A load running on a background worker.
#[derive(Debug)]
pub struct LoadTask {
    name: String,
    cancel: CancellationToken,
    handle: Result<JoinHandle<LoadResult<Arc<LoadedModule>>>, String>,
}

impl LoadTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation; a running toolchain is killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Blocks until the load finished.
    pub fn wait(self) -> LoadResult<Arc<LoadedModule>> {
        let handle = self.handle.map_err(LoadError::Worker)?;
        handle.join().unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(LoadError::Worker(message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::LoadError;
    use crate::build::BuildError;
    use crate::registry::RegistryError;

    #[test]
    fn build_cancellation_maps_to_load_cancellation() {
        assert!(LoadError::from(BuildError::Cancelled).is_cancelled());
        assert!(matches!(
            LoadError::from(BuildError::ToolchainUnavailable("none".into())),
            LoadError::Build(BuildError::ToolchainUnavailable(_))
        ));
    }

    #[test]
    fn already_loaded_is_recognized() {
        let err = LoadError::from(RegistryError::AlreadyLoaded("sdl".into()));
        assert!(err.is_already_loaded());
        assert_eq!(err.to_string(), "module already loaded: sdl");
    }
}
