//! Typed native module manifest.
//!
//! # Responsibility
//! - Define the closed schema a `module.json` is validated into.
//! - Provide per-platform accessors used by the build driver and binder.
//!
//! # Invariants
//! - A `ModuleManifest` is immutable after the loader produced it.
//! - Platform-keyed maps only contain supported platforms; unknown keys are
//!   recorded in `ignored_platform_keys` instead.
//! - `cpp_name` values are unique C identifiers when present.

use crate::platform::Platform;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Semantic type of one parameter or return value.
///
/// This is the closed set the binder knows how to marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// No value. Valid in return position only.
    Void,
    Bool,
    /// C `int`, 32 bits.
    Int,
    /// 64-bit signed integer.
    Long,
    Double,
    /// NUL-terminated UTF-8 string.
    String,
    /// Opaque pointer-sized value, never dereferenced by the loader.
    Handle,
}

impl SemanticType {
    /// Canonical manifest spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Handle => "handle",
        }
    }

    /// C++ spelling used in generated export declarations.
    pub fn cpp_type(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long long",
            Self::Double => "double",
            Self::String => "const char*",
            Self::Handle => "void*",
        }
    }

    /// Whether this type may appear as a parameter.
    pub fn is_value_type(self) -> bool {
        !matches!(self, Self::Void)
    }
}

impl Display for SemanticType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses one semantic type name as written in a manifest.
pub fn parse_semantic_type(value: &str) -> Result<SemanticType, UnknownSemanticType> {
    match value.trim() {
        "void" => Ok(SemanticType::Void),
        "bool" => Ok(SemanticType::Bool),
        "int" => Ok(SemanticType::Int),
        "long" | "int64" => Ok(SemanticType::Long),
        "double" => Ok(SemanticType::Double),
        "string" => Ok(SemanticType::String),
        "handle" | "void*" | "pointer" => Ok(SemanticType::Handle),
        other => Err(UnknownSemanticType(other.to_string())),
    }
}

/// Error for a type name outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSemanticType(pub String);

impl Display for UnknownSemanticType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown type `{}` (expected string|int|long|double|bool|handle|void)",
            self.0
        )
    }
}

impl Error for UnknownSemanticType {}

/// Semantic version triple (`major.minor.patch`).
///
/// Metadata only: no compatibility policy is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ModuleVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ModuleVersion {
    /// Parses a strict `major.minor.patch` string.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('.');
        let major = parse_version_part(parts.next()?)?;
        let minor = parse_version_part(parts.next()?)?;
        let patch = parse_version_part(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

fn parse_version_part(part: &str) -> Option<u64> {
    if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

impl Display for ModuleVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
}

/// Declared return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnSpec {
    #[serde(rename = "type")]
    pub ty: SemanticType,
    pub description: String,
}

impl ReturnSpec {
    pub fn void() -> Self {
        Self {
            ty: SemanticType::Void,
            description: String::new(),
        }
    }
}

/// One script-visible function declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSpec {
    pub description: String,
    /// Native entry symbol. Required for native modules.
    pub cpp_name: Option<String>,
    pub params: Vec<ParamSpec>,
    #[serde(rename = "return")]
    pub returns: ReturnSpec,
}

impl FunctionSpec {
    /// Human-readable signature, e.g. `int jp_add(int a, int b)`.
    pub fn signature(&self, script_name: &str) -> String {
        let params = self
            .params
            .iter()
            .map(|param| format!("{} {}", param.ty, param.name))
            .collect::<Vec<_>>()
            .join(", ");
        let symbol = self.cpp_name.as_deref().unwrap_or(script_name);
        format!("{} {}({})", self.returns.ty, symbol, params)
    }
}

/// Pre-built binaries shipped for one platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    /// Loadable libraries, relative to the module root.
    pub dlls: Vec<String>,
    /// Link inputs (and loadable `.so`/`.dylib` on unix), relative to the module root.
    pub libs: Vec<String>,
}

impl BundleInfo {
    pub fn is_empty(&self) -> bool {
        self.dlls.is_empty() && self.libs.is_empty()
    }

    /// All declared paths, dlls first.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.dlls.iter().chain(self.libs.iter()).map(String::as_str)
    }
}

/// Optional lifecycle symbols, each `extern "C" void fn(void)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleEntrypoints {
    /// Called once after binding, before the module becomes visible.
    pub init: Option<String>,
    /// Called once when the registry tears the module down.
    pub dispose: Option<String>,
}

impl ModuleEntrypoints {
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.init.iter().chain(self.dispose.iter()).map(String::as_str)
    }
}

/// Validated native module descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleManifest {
    /// Unique module identifier (the name scripts import).
    pub name: String,
    pub version: ModuleVersion,
    pub description: String,
    /// Whether the module carries native code at all.
    pub native: bool,
    pub author: Option<String>,
    pub license: Option<String>,
    pub repository: Option<String>,
    /// Header references in declaration order, e.g. `<SDL2/SDL.h>`.
    pub includes: Vec<String>,
    pub libraries: BTreeMap<Platform, Vec<String>>,
    /// Source paths relative to `root_dir`, in compilation order.
    pub source_files: Vec<String>,
    pub custom_code: Option<String>,
    pub functions: BTreeMap<String, FunctionSpec>,
    pub bundled: bool,
    pub bundle_info: BTreeMap<Platform, BundleInfo>,
    /// Advisory install instructions, never enforced.
    pub dependencies: BTreeMap<Platform, String>,
    pub entrypoints: ModuleEntrypoints,
    /// Platform keys that were present in the document but not supported.
    pub ignored_platform_keys: Vec<String>,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub root_dir: PathBuf,
}

impl ModuleManifest {
    /// Link flags for `platform`; an absent key is an empty flag set.
    pub fn link_flags(&self, platform: Platform) -> &[String] {
        self.libraries
            .get(&platform)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn bundle_for(&self, platform: Platform) -> Option<&BundleInfo> {
        self.bundle_info.get(&platform)
    }

    pub fn dependency_hint(&self, platform: Platform) -> Option<&str> {
        self.dependencies.get(&platform).map(String::as_str)
    }

    /// Whether loading this module goes through the build driver.
    pub fn requires_build(&self) -> bool {
        self.native
    }

    /// Resolves a manifest-relative path against the module root.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// Functions that carry a native entry symbol, in script-name order.
    pub fn native_functions(&self) -> impl Iterator<Item = (&str, &FunctionSpec, &str)> {
        self.functions.iter().filter_map(|(name, spec)| {
            spec.cpp_name
                .as_deref()
                .map(|symbol| (name.as_str(), spec, symbol))
        })
    }

    /// Returns a copy rooted at `root_dir`.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_semantic_type, FunctionSpec, ModuleVersion, ParamSpec, ReturnSpec, SemanticType};

    #[test]
    fn parses_semantic_types_and_aliases() {
        assert_eq!(parse_semantic_type("int").unwrap(), SemanticType::Int);
        assert_eq!(parse_semantic_type("void*").unwrap(), SemanticType::Handle);
        assert_eq!(parse_semantic_type("pointer").unwrap(), SemanticType::Handle);
        assert_eq!(parse_semantic_type("int64").unwrap(), SemanticType::Long);
        assert!(parse_semantic_type("float").is_err());
        assert!(parse_semantic_type("Int").is_err());
    }

    #[test]
    fn void_is_not_a_value_type() {
        assert!(!SemanticType::Void.is_value_type());
        assert!(SemanticType::Handle.is_value_type());
    }

    #[test]
    fn parses_strict_version_triplets() {
        let version = ModuleVersion::parse("1.20.3").unwrap();
        assert_eq!(version.to_string(), "1.20.3");
        assert!(ModuleVersion::parse("1.2").is_none());
        assert!(ModuleVersion::parse("1.2.3.4").is_none());
        assert!(ModuleVersion::parse("v1.2.3").is_none());
        assert!(ModuleVersion::parse("1.+2.3").is_none());
    }

    #[test]
    fn rejects_leading_zeros_in_version_parts() {
        assert!(ModuleVersion::parse("01.2.3").is_none());
        assert!(ModuleVersion::parse("1.02.3").is_none());
        assert!(ModuleVersion::parse("1.2.00").is_none());
        assert_eq!(ModuleVersion::parse("0.0.0").unwrap().to_string(), "0.0.0");
        assert_eq!(ModuleVersion::parse("10.0.7").unwrap().to_string(), "10.0.7");
    }

    #[test]
    fn renders_function_signature() {
        let spec = FunctionSpec {
            description: String::new(),
            cpp_name: Some("jp_add".to_string()),
            params: vec![
                ParamSpec {
                    name: "a".to_string(),
                    ty: SemanticType::Int,
                },
                ParamSpec {
                    name: "b".to_string(),
                    ty: SemanticType::Int,
                },
            ],
            returns: ReturnSpec {
                ty: SemanticType::Int,
                description: "sum".to_string(),
            },
        };
        assert_eq!(spec.signature("add"), "int jp_add(int a, int b)");
    }
}
