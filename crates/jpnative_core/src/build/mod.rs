//! Native build driver.
//!
//! # Responsibility
//! - Produce a loadable artifact for a (manifest, platform) pair.
//! - Compile and link through a `Toolchain`, or adopt bundled binaries.
//! - Reuse earlier artifacts through the content-addressed `BuildCache`.
//!
//! # Invariants
//! - Every toolchain run happens inside its own scratch directory, which is
//!   removed on success, failure and cancellation alike.
//! - Builds of the same cache key are serialized; the toolchain runs once.
//! - Nothing is cached unless compile and link both succeeded.

pub mod artifact;
pub mod cache;
pub mod toolchain;
pub mod unit;

use crate::cancel::CancellationToken;
use crate::config::{ConfigError, LoaderConfig};
use crate::db::DbError;
use crate::gate::KeyedGate;
use crate::manifest::ModuleManifest;
use crate::platform::Platform;
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub use artifact::{ArtifactHandle, ArtifactKind};
pub use cache::BuildCache;
pub use toolchain::{
    detect_toolchain, CommandToolchain, CompileRequest, CompilerFamily, LinkRequest, Toolchain,
};
pub use unit::CompilationUnit;

const UNIT_FILE_NAME: &str = "unit.cpp";
const ARTIFACT_KEY_CHARS: usize = 16;

pub type BuildResult<T> = Result<T, BuildError>;

/// Build driver errors.
#[derive(Debug)]
pub enum BuildError {
    InvalidConfig(ConfigError),
    /// No usable compiler could be found or started.
    ToolchainUnavailable(String),
    CompilationFailed {
        diagnostics: String,
    },
    LinkFailed {
        diagnostics: String,
    },
    BundleFileMissing(PathBuf),
    NoBundleForPlatform(Platform),
    SourceUnreadable {
        path: PathBuf,
        reason: String,
    },
    Cancelled,
    Io {
        context: String,
        source: std::io::Error,
    },
    Cache(DbError),
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(err) => write!(f, "invalid loader configuration: {err}"),
            Self::ToolchainUnavailable(reason) => write!(f, "toolchain unavailable: {reason}"),
            Self::CompilationFailed { diagnostics } => {
                write!(f, "compilation failed:\n{diagnostics}")
            }
            Self::LinkFailed { diagnostics } => write!(f, "link failed:\n{diagnostics}"),
            Self::BundleFileMissing(path) => {
                write!(f, "bundled file missing: {}", path.display())
            }
            Self::NoBundleForPlatform(platform) => {
                write!(f, "module bundles no binaries for `{platform}`")
            }
            Self::SourceUnreadable { path, reason } => {
                write!(f, "cannot read source `{}`: {reason}", path.display())
            }
            Self::Cancelled => write!(f, "build cancelled"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Cache(err) => write!(f, "build cache: {err}"),
        }
    }
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidConfig(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for BuildError {
    fn from(value: DbError) -> Self {
        Self::Cache(value)
    }
}

impl From<ConfigError> for BuildError {
    fn from(value: ConfigError) -> Self {
        Self::InvalidConfig(value)
    }
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BuildError {
    let context = context.into();
    move |source| BuildError::Io { context, source }
}

/// Turns manifests into native artifacts.
#[derive(Debug)]
pub struct BuildDriver {
    config: LoaderConfig,
    cache: BuildCache,
    toolchain: Option<Arc<dyn Toolchain>>,
    gate: KeyedGate,
    invocations: AtomicUsize,
}

impl BuildDriver {
    /// Driver that discovers its compiler from `config` on first compile.
    ///
    /// # Errors
    /// - `InvalidConfig` when `config.validate()` fails.
    /// - `Io`/`Cache` when the build directory or cache index cannot be prepared.
    pub fn new(config: LoaderConfig) -> BuildResult<Self> {
        Self::create(config, None)
    }

    /// Driver that always compiles with `toolchain`.
    pub fn with_toolchain(
        config: LoaderConfig,
        toolchain: Arc<dyn Toolchain>,
    ) -> BuildResult<Self> {
        Self::create(config, Some(toolchain))
    }

    fn create(config: LoaderConfig, toolchain: Option<Arc<dyn Toolchain>>) -> BuildResult<Self> {
        config.validate()?;
        let cache = if config.persistent_cache {
            std::fs::create_dir_all(&config.build_root).map_err(io_error(format!(
                "creating build root `{}`",
                config.build_root.display()
            )))?;
            BuildCache::open(config.cache_index_path())?
        } else {
            BuildCache::in_memory()
        };
        Ok(Self {
            config,
            cache,
            toolchain,
            gate: KeyedGate::new(),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Number of builds that reached the toolchain since creation.
    pub fn toolchain_invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn build(&self, manifest: &ModuleManifest, target: Platform) -> BuildResult<ArtifactHandle> {
        self.build_with_cancel(manifest, target, &CancellationToken::new())
    }

    /// Builds (or adopts) the artifact for `manifest` on `target`.
    ///
    /// # Errors
    /// - See `BuildError`; `Cancelled` when `cancel` fired at any step.
    pub fn build_with_cancel(
        &self,
        manifest: &ModuleManifest,
        target: Platform,
        cancel: &CancellationToken,
    ) -> BuildResult<ArtifactHandle> {
        let started_at = Instant::now();
        let mode = if manifest.bundled { "bundled" } else { "compiled" };
        info!(
            "event=native_build module=build status=start name={} platform={target} mode={mode}",
            manifest.name
        );

        let result = if manifest.bundled {
            adopt_bundle(manifest, target)
        } else {
            self.compile_artifact(manifest, target, cancel)
        };

        match &result {
            Ok(handle) => info!(
                "event=native_build module=build status=ok name={} platform={target} mode={mode} key={} duration_ms={}",
                manifest.name,
                short_key(&handle.cache_key),
                started_at.elapsed().as_millis()
            ),
            Err(BuildError::Cancelled) => info!(
                "event=native_build module=build status=cancelled name={} platform={target}",
                manifest.name
            ),
            Err(err) => {
                error!(
                    "event=native_build module=build status=error name={} platform={target} duration_ms={} error_kind={}",
                    manifest.name,
                    started_at.elapsed().as_millis(),
                    error_kind(err)
                );
                if matches!(
                    err,
                    BuildError::ToolchainUnavailable(_) | BuildError::LinkFailed { .. }
                ) {
                    if let Some(hint) = manifest.dependency_hint(target) {
                        warn!(
                            "event=dependency_hint module=build name={} platform={target} hint={hint:?}",
                            manifest.name
                        );
                    }
                }
            }
        }
        result
    }

    fn compile_artifact(
        &self,
        manifest: &ModuleManifest,
        target: Platform,
        cancel: &CancellationToken,
    ) -> BuildResult<ArtifactHandle> {
        check_cancel(cancel)?;
        let unit = CompilationUnit::assemble(manifest, target)?;
        let toolchain = self.resolve_toolchain(target)?;
        let fingerprint = toolchain.fingerprint();

        let mut settings = vec![fingerprint.as_str(), self.config.cxx_standard.as_str()];
        settings.extend(self.config.extra_cxx_flags.iter().map(String::as_str));
        let key = unit.cache_key(&settings);

        let _guard = self.gate.enter(&key);
        if let Some(handle) = self.cache.get(&key)? {
            info!(
                "event=cache_hit module=build status=ok name={} platform={target} key={}",
                manifest.name,
                short_key(&key)
            );
            return Ok(handle);
        }
        check_cancel(cancel)?;

        let scratch_root = self.config.scratch_dir();
        std::fs::create_dir_all(&scratch_root).map_err(io_error(format!(
            "creating scratch root `{}`",
            scratch_root.display()
        )))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", manifest.name))
            .tempdir_in(&scratch_root)
            .map_err(io_error("creating scratch directory"))?;

        let source_path = scratch.path().join(UNIT_FILE_NAME);
        std::fs::write(&source_path, &unit.source)
            .map_err(io_error(format!("writing `{}`", source_path.display())))?;

        let object = scratch.path().join(object_file_name(target));
        let library_name = target.shared_library_name(&manifest.name);
        let output = scratch.path().join(&library_name);

        self.invocations.fetch_add(1, Ordering::SeqCst);
        toolchain.compile(
            &CompileRequest {
                source: &source_path,
                object: &object,
                include_dirs: &unit.include_dirs,
                cxx_standard: &self.config.cxx_standard,
                extra_flags: &self.config.extra_cxx_flags,
            },
            cancel,
        )?;
        check_cancel(cancel)?;

        let objects = [object];
        toolchain.link(
            &LinkRequest {
                objects: &objects,
                output: &output,
                link_flags: &unit.link_flags,
            },
            cancel,
        )?;
        check_cancel(cancel)?;

        let library = self.publish(&output, manifest, target, &key, &library_name)?;
        let handle = ArtifactHandle::compiled(
            manifest.name.clone(),
            target,
            key,
            library,
            Some(fingerprint),
        );
        self.cache.insert(&handle)?;
        Ok(handle)
    }

    /// Forgets a compiled artifact whose exported symbols failed validation,
    /// so the next build recompiles instead of replaying the broken library.
    /// Bundled artifacts are never cached and are left alone.
    pub fn discard(&self, artifact: &ArtifactHandle) -> BuildResult<()> {
        if artifact.is_bundled() {
            return Ok(());
        }
        let _guard = self.gate.enter(&artifact.cache_key);
        self.cache.remove(&artifact.cache_key)?;
        info!(
            "event=cache_discard module=build status=ok name={} platform={} key={}",
            artifact.module_name,
            artifact.platform,
            short_key(&artifact.cache_key)
        );
        Ok(())
    }

    fn resolve_toolchain(&self, target: Platform) -> BuildResult<Arc<dyn Toolchain>> {
        if let Some(toolchain) = &self.toolchain {
            return Ok(Arc::clone(toolchain));
        }
        let mut config = self.config.clone();
        config.target = target;
        Ok(Arc::new(detect_toolchain(&config)?))
    }

    /// Moves the linked library out of the scratch directory into the artifact store.
    fn publish(
        &self,
        output: &Path,
        manifest: &ModuleManifest,
        target: Platform,
        key: &str,
        library_name: &str,
    ) -> BuildResult<PathBuf> {
        if !output.is_file() {
            return Err(BuildError::LinkFailed {
                diagnostics: format!("linker produced no `{}`", output.display()),
            });
        }
        let dir = self
            .config
            .artifact_dir()
            .join(&manifest.name)
            .join(target.as_str())
            .join(short_key(key));
        std::fs::create_dir_all(&dir)
            .map_err(io_error(format!("creating artifact dir `{}`", dir.display())))?;

        let library = dir.join(library_name);
        if library.exists() {
            std::fs::remove_file(&library)
                .map_err(io_error(format!("replacing `{}`", library.display())))?;
        }
        if std::fs::rename(output, &library).is_err() {
            std::fs::copy(output, &library)
                .map_err(io_error(format!("storing `{}`", library.display())))?;
        }
        Ok(library)
    }
}

/// Verifies bundled binaries for `target` and wraps them in a handle.
fn adopt_bundle(manifest: &ModuleManifest, target: Platform) -> BuildResult<ArtifactHandle> {
    let bundle = manifest
        .bundle_for(target)
        .filter(|bundle| !bundle.is_empty())
        .ok_or(BuildError::NoBundleForPlatform(target))?;

    let resolve = |paths: &[String]| -> BuildResult<Vec<PathBuf>> {
        paths
            .iter()
            .map(|relative| {
                let path = manifest.resolve_path(relative);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(BuildError::BundleFileMissing(path))
                }
            })
            .collect()
    };
    let dlls = resolve(&bundle.dlls)?;
    let libs = resolve(&bundle.libs)?;

    let all = dlls.iter().chain(libs.iter()).cloned().collect::<Vec<_>>();
    let key = unit::bundle_cache_key(&manifest.name, target, &all);
    Ok(ArtifactHandle::bundled(
        manifest.name.clone(),
        target,
        key,
        dlls,
        libs,
    ))
}

fn check_cancel(cancel: &CancellationToken) -> BuildResult<()> {
    if cancel.is_cancelled() {
        Err(BuildError::Cancelled)
    } else {
        Ok(())
    }
}

fn object_file_name(target: Platform) -> &'static str {
    match target {
        Platform::Windows => "unit.obj",
        Platform::Linux | Platform::Macos => "unit.o",
    }
}

fn short_key(key: &str) -> &str {
    key.get(..ARTIFACT_KEY_CHARS).unwrap_or(key)
}

fn error_kind(err: &BuildError) -> &'static str {
    match err {
        BuildError::InvalidConfig(_) => "invalid_config",
        BuildError::ToolchainUnavailable(_) => "toolchain_unavailable",
        BuildError::CompilationFailed { .. } => "compilation_failed",
        BuildError::LinkFailed { .. } => "link_failed",
        BuildError::BundleFileMissing(_) => "bundle_file_missing",
        BuildError::NoBundleForPlatform(_) => "no_bundle_for_platform",
        BuildError::SourceUnreadable { .. } => "source_unreadable",
        BuildError::Cancelled => "cancelled",
        BuildError::Io { .. } => "io",
        BuildError::Cache(_) => "cache",
    }
}
