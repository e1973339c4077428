//! Handles to produced native artifacts.

use crate::platform::Platform;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How an artifact came into existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Built by the toolchain from the module's sources.
    Compiled { library: PathBuf },
    /// Pre-built binaries shipped with the module.
    Bundled {
        dlls: Vec<PathBuf>,
        libs: Vec<PathBuf>,
    },
}

/// Native artifact for one (manifest, platform) pair.
///
/// Cheap to clone; the files it names are owned by the build directory
/// (compiled) or the module directory (bundled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    /// Identity assigned when the artifact was produced.
    pub id: Uuid,
    pub module_name: String,
    pub platform: Platform,
    /// Content hash the artifact was produced for.
    pub cache_key: String,
    pub kind: ArtifactKind,
    /// Fingerprint of the toolchain that produced a compiled artifact.
    pub toolchain: Option<String>,
}

impl ArtifactHandle {
    pub fn compiled(
        module_name: impl Into<String>,
        platform: Platform,
        cache_key: impl Into<String>,
        library: PathBuf,
        toolchain: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_name: module_name.into(),
            platform,
            cache_key: cache_key.into(),
            kind: ArtifactKind::Compiled { library },
            toolchain,
        }
    }

    pub fn bundled(
        module_name: impl Into<String>,
        platform: Platform,
        cache_key: impl Into<String>,
        dlls: Vec<PathBuf>,
        libs: Vec<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_name: module_name.into(),
            platform,
            cache_key: cache_key.into(),
            kind: ArtifactKind::Bundled { dlls, libs },
            toolchain: None,
        }
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self.kind, ArtifactKind::Bundled { .. })
    }

    /// Every file the artifact consists of.
    pub fn files(&self) -> Vec<&Path> {
        match &self.kind {
            ArtifactKind::Compiled { library } => vec![library.as_path()],
            ArtifactKind::Bundled { dlls, libs } => {
                dlls.iter().chain(libs.iter()).map(PathBuf::as_path).collect()
            }
        }
    }

    /// Files the dynamic loader should open, in symbol search order.
    pub fn loadable_libraries(&self) -> Vec<&Path> {
        match &self.kind {
            ArtifactKind::Compiled { library } => vec![library.as_path()],
            ArtifactKind::Bundled { .. } => self
                .files()
                .into_iter()
                .filter(|path| {
                    path.to_str()
                        .is_some_and(|value| self.platform.is_loadable_library(value))
                })
                .collect(),
        }
    }

    /// Whether every file of the artifact is still present on disk.
    pub fn files_exist(&self) -> bool {
        self.files().iter().all(|path| path.is_file())
    }
}
