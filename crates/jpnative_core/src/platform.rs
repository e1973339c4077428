//! Target platform declarations used to key builds, link flags and bundles.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Target platform for one native artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Linux,
    Macos,
}

/// Manifest string value for Windows targets.
pub const PLATFORM_WINDOWS: &str = "windows";
/// Manifest string value for Linux targets.
pub const PLATFORM_LINUX: &str = "linux";
/// Manifest string value for macOS targets.
pub const PLATFORM_MACOS: &str = "macos";

const SUPPORTED_PLATFORM_STRINGS: &[&str] = &[PLATFORM_WINDOWS, PLATFORM_LINUX, PLATFORM_MACOS];

impl Platform {
    /// Every supported platform, in manifest declaration order.
    pub const ALL: [Platform; 3] = [Platform::Windows, Platform::Linux, Platform::Macos];

    /// Stable string id used in manifest keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => PLATFORM_WINDOWS,
            Self::Linux => PLATFORM_LINUX,
            Self::Macos => PLATFORM_MACOS,
        }
    }

    /// Platform of the running process, if it is one of the supported targets.
    pub fn host() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(Self::Windows)
        } else if cfg!(target_os = "linux") {
            Some(Self::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Self::Macos)
        } else {
            None
        }
    }

    /// File name of the loadable library produced for module `name`.
    pub fn shared_library_name(self, name: &str) -> String {
        match self {
            Self::Windows => format!("{name}.dll"),
            Self::Linux => format!("lib{name}.so"),
            Self::Macos => format!("lib{name}.dylib"),
        }
    }

    /// Whether `path` names something the dynamic loader can open on this platform.
    ///
    /// Static and import libraries (`.a`, `.lib`) are link inputs only.
    pub fn is_loadable_library(self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        match self {
            Self::Windows => lower.ends_with(".dll"),
            Self::Linux => lower.ends_with(".so") || lower.contains(".so."),
            Self::Macos => lower.ends_with(".dylib") || lower.ends_with(".so"),
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_platform(value)
    }
}

/// Returns supported platform key strings.
pub fn supported_platform_strings() -> &'static [&'static str] {
    SUPPORTED_PLATFORM_STRINGS
}

/// Parses one platform tag from a manifest key.
pub fn parse_platform(value: &str) -> Result<Platform, PlatformError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(PlatformError::EmptyPlatform);
    }

    match normalized {
        PLATFORM_WINDOWS => Ok(Platform::Windows),
        PLATFORM_LINUX => Ok(Platform::Linux),
        PLATFORM_MACOS => Ok(Platform::Macos),
        other => Err(PlatformError::UnsupportedPlatform(other.to_string())),
    }
}

/// Platform parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    EmptyPlatform,
    UnsupportedPlatform(String),
}

impl Display for PlatformError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPlatform => write!(f, "platform value must not be empty"),
            Self::UnsupportedPlatform(value) => write!(
                f,
                "platform is unsupported: {value} (expected windows|linux|macos)"
            ),
        }
    }
}

impl Error for PlatformError {}
