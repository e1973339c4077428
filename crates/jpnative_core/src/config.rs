//! Loader configuration.
//!
//! # Responsibility
//! - Collect build directory, target platform and toolchain overrides.
//! - Read process environment overrides in one place.
//!
//! # Invariants
//! - `build_root` is absolute once `validate()` succeeded.
//! - Environment parsing never panics; bad values surface as `ConfigError`.

use crate::platform::{parse_platform, Platform, PlatformError};
use std::error::Error;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the build directory.
pub const ENV_BUILD_DIR: &str = "JPNATIVE_BUILD_DIR";
/// Environment variable overriding the target platform.
pub const ENV_TARGET: &str = "JPNATIVE_TARGET";
/// Environment variable naming the C++ compiler driver.
pub const ENV_CXX: &str = "JPNATIVE_CXX";
/// Conventional compiler variable consulted when `JPNATIVE_CXX` is unset.
pub const ENV_CXX_FALLBACK: &str = "CXX";
/// Whitespace-separated extra compiler flags.
pub const ENV_CXXFLAGS: &str = "JPNATIVE_CXXFLAGS";
/// Any non-empty value disables the persistent cache index.
pub const ENV_NO_CACHE: &str = "JPNATIVE_NO_CACHE";

const DEFAULT_CXX_STANDARD: &str = "c++17";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const BUILD_DIR_NAME: &str = "jpnative-build";

/// Native loader settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Process-owned directory for artifacts, scratch dirs and the cache index.
    pub build_root: PathBuf,
    /// Platform artifacts are built for.
    pub target: Platform,
    /// Explicit compiler driver; skips `PATH` discovery when set.
    pub compiler: Option<PathBuf>,
    /// Language standard passed to the compiler.
    pub cxx_standard: String,
    /// Extra flags appended to every compile command.
    pub extra_cxx_flags: Vec<String>,
    /// Whether the build cache index is persisted under `build_root`.
    pub persistent_cache: bool,
    /// How often a running toolchain subprocess is checked for exit/cancellation.
    pub poll_interval: Duration,
}

impl LoaderConfig {
    /// Default settings for the host platform rooted at `build_root`.
    ///
    /// # Errors
    /// - `UnsupportedHost` when the running OS is not a supported target.
    pub fn for_host(build_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let target = Platform::host().ok_or(ConfigError::UnsupportedHost)?;
        Ok(Self::new(build_root, target))
    }

    pub fn new(build_root: impl Into<PathBuf>, target: Platform) -> Self {
        Self {
            build_root: build_root.into(),
            target,
            compiler: None,
            cxx_standard: DEFAULT_CXX_STANDARD.to_string(),
            extra_cxx_flags: Vec::new(),
            persistent_cache: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Reads settings through `lookup`, which maps variable names to values.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<OsString>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let build_root = non_empty(ENV_BUILD_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(BUILD_DIR_NAME));

        let target = match non_empty(ENV_TARGET) {
            Some(value) => {
                let value = value.to_string_lossy().into_owned();
                parse_platform(&value).map_err(ConfigError::InvalidTarget)?
            }
            None => Platform::host().ok_or(ConfigError::UnsupportedHost)?,
        };

        let mut config = Self::new(build_root, target);
        config.compiler = non_empty(ENV_CXX)
            .or_else(|| non_empty(ENV_CXX_FALLBACK))
            .map(PathBuf::from);
        config.extra_cxx_flags = non_empty(ENV_CXXFLAGS)
            .map(|value| {
                value
                    .to_string_lossy()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        config.persistent_cache = non_empty(ENV_NO_CACHE).is_none();
        config.validate()?;
        Ok(config)
    }

    /// Validates settings before a driver uses them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.build_root.is_absolute() {
            return Err(ConfigError::RelativeBuildRoot(self.build_root.clone()));
        }
        if self.cxx_standard.trim().is_empty() {
            return Err(ConfigError::EmptyCxxStandard);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    /// Directory finished artifacts are stored under.
    pub fn artifact_dir(&self) -> PathBuf {
        self.build_root.join("artifacts")
    }

    /// Directory per-build scratch directories are created in.
    pub fn scratch_dir(&self) -> PathBuf {
        self.build_root.join("tmp")
    }

    /// Location of the persistent cache index.
    pub fn cache_index_path(&self) -> PathBuf {
        self.build_root.join("build-cache.sqlite3")
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnsupportedHost,
    InvalidTarget(PlatformError),
    RelativeBuildRoot(PathBuf),
    EmptyCxxStandard,
    ZeroPollInterval,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedHost => write!(
                f,
                "host OS `{}` is not a supported target",
                std::env::consts::OS
            ),
            Self::InvalidTarget(err) => write!(f, "invalid {ENV_TARGET}: {err}"),
            Self::RelativeBuildRoot(path) => write!(
                f,
                "build root must be an absolute path, got `{}`",
                path.display()
            ),
            Self::EmptyCxxStandard => write!(f, "C++ standard must not be empty"),
            Self::ZeroPollInterval => write!(f, "poll interval must be non-zero"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidTarget(err) => Some(err),
            _ => None,
        }
    }
}
