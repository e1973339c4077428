//! Manifest parsing and validation.
//!
//! # Responsibility
//! - Parse `module.json` text into a validated `ModuleManifest`.
//! - Reject missing, malformed and conflicting declarations up front.
//!
//! # Invariants
//! - `load` is pure: it never touches the filesystem.
//! - A manifest that fails validation is never partially returned.

use crate::manifest::model::{
    parse_semantic_type, BundleInfo, FunctionSpec, ModuleEntrypoints, ModuleManifest,
    ModuleVersion, ParamSpec, ReturnSpec,
};
use crate::platform::{parse_platform, Platform};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

static MODULE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid module name regex"));
static C_IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

const RESERVED_NAME_PREFIX: &str = "import_";

/// Manifest parse/validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    MalformedManifest(String),
    MissingRequiredField(&'static str),
    InvalidField {
        field: &'static str,
        reason: String,
    },
    InvalidFunctionSpec {
        function: String,
        reason: String,
    },
    ConflictingSourceSpec(String),
    Unreadable {
        path: PathBuf,
        reason: String,
    },
}

impl Display for ManifestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedManifest(reason) => write!(f, "malformed manifest: {reason}"),
            Self::MissingRequiredField(field) => {
                write!(f, "manifest missing required field: {field}")
            }
            Self::InvalidField { field, reason } => {
                write!(f, "manifest field `{field}` is invalid: {reason}")
            }
            Self::InvalidFunctionSpec { function, reason } => {
                write!(f, "function `{function}` is invalid: {reason}")
            }
            Self::ConflictingSourceSpec(reason) => {
                write!(f, "manifest source declaration is inconsistent: {reason}")
            }
            Self::Unreadable { path, reason } => {
                write!(f, "cannot read manifest `{}`: {reason}", path.display())
            }
        }
    }
}

impl Error for ManifestError {}

/// Parses manifest text into a validated model rooted at the current directory.
///
/// # Errors
/// - `MalformedManifest` for JSON syntax/shape errors and duplicate function names.
/// - `MissingRequiredField` when `name`, `version`, `description` or `functions` is absent.
/// - `InvalidField`, `InvalidFunctionSpec`, `ConflictingSourceSpec` for
///   declaration-level violations.
pub fn load(manifest_text: &str) -> Result<ModuleManifest, ManifestError> {
    let raw: RawManifest = serde_json::from_str(manifest_text)
        .map_err(|err| ManifestError::MalformedManifest(err.to_string()))?;
    raw.into_manifest()
}

/// Reads and parses a manifest file; relative paths resolve against its directory.
pub fn load_file(path: impl AsRef<Path>) -> Result<ModuleManifest, ManifestError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|err| ManifestError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let root = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(load(&text)?.with_root_dir(root))
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    native: bool,
    author: Option<String>,
    license: Option<String>,
    repository: Option<String>,
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    libraries: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    source_files: Vec<String>,
    custom_code: Option<RawCode>,
    functions: Option<UniqueMap<RawFunction>>,
    #[serde(default)]
    bundled: bool,
    #[serde(default)]
    bundle_info: BTreeMap<String, RawBundle>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    entrypoints: RawEntrypoints,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Inline code, either one string or a list of lines.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCode {
    Text(String),
    Lines(Vec<String>),
}

impl RawCode {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    #[serde(default)]
    description: String,
    cpp_name: Option<String>,
    #[serde(default)]
    params: Vec<RawParam>,
    #[serde(rename = "return")]
    returns: Option<RawReturn>,
}

#[derive(Debug, Deserialize)]
struct RawParam {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct RawReturn {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawBundle {
    #[serde(default)]
    dlls: Vec<String>,
    #[serde(default)]
    libs: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntrypoints {
    init: Option<String>,
    dispose: Option<String>,
}

/// JSON object that rejects repeated keys instead of keeping the last one.
#[derive(Debug)]
struct UniqueMap<V>(BTreeMap<String, V>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for UniqueMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UniqueMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueMapVisitor<V> {
            type Value = UniqueMap<V>;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str("an object with unique keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if entries.contains_key(&key) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate function name `{key}`"
                        )));
                    }
                    entries.insert(key, value);
                }
                Ok(UniqueMap(entries))
            }
        }

        deserializer.deserialize_map(UniqueMapVisitor(PhantomData))
    }
}

impl RawManifest {
    fn into_manifest(self) -> Result<ModuleManifest, ManifestError> {
        let name = self
            .name
            .ok_or(ManifestError::MissingRequiredField("name"))?;
        let version = self
            .version
            .ok_or(ManifestError::MissingRequiredField("version"))?;
        let description = self
            .description
            .ok_or(ManifestError::MissingRequiredField("description"))?;
        let raw_functions = self
            .functions
            .ok_or(ManifestError::MissingRequiredField("functions"))?;

        let name = validate_module_name(&name)?;
        let version = ModuleVersion::parse(&version).ok_or_else(|| ManifestError::InvalidField {
            field: "version",
            reason: format!("`{version}` (expected major.minor.patch)"),
        })?;

        let mut ignored_platform_keys = BTreeSet::new();
        let libraries = keyed_by_platform(self.libraries, &mut ignored_platform_keys);
        let bundle_info = keyed_by_platform(self.bundle_info, &mut ignored_platform_keys)
            .into_iter()
            .map(|(platform, raw)| {
                (
                    platform,
                    BundleInfo {
                        dlls: raw.dlls,
                        libs: raw.libs,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        let dependencies = keyed_by_platform(self.dependencies, &mut ignored_platform_keys);

        let functions = validate_functions(raw_functions.0, self.native)?;
        let entrypoints = validate_entrypoints(self.entrypoints)?;

        let custom_code = self
            .custom_code
            .map(RawCode::into_text)
            .filter(|code| !code.trim().is_empty());

        if self.bundled {
            if !self.native {
                return Err(ManifestError::ConflictingSourceSpec(
                    "bundled modules must declare `native: true`".to_string(),
                ));
            }
            if bundle_info.values().all(BundleInfo::is_empty) {
                return Err(ManifestError::ConflictingSourceSpec(
                    "`bundled` is true but `bundle_info` declares no binaries".to_string(),
                ));
            }
        } else if self.native && self.source_files.is_empty() && custom_code.is_none() {
            return Err(ManifestError::ConflictingSourceSpec(
                "native module declares neither `source_files` nor `custom_code`".to_string(),
            ));
        }

        for key in self.extra.keys() {
            warn!("event=manifest_parse module=manifest status=warn name={name} unknown_field={key}");
        }
        let ignored_platform_keys = ignored_platform_keys.into_iter().collect::<Vec<_>>();
        for key in &ignored_platform_keys {
            warn!("event=manifest_parse module=manifest status=warn name={name} ignored_platform={key}");
        }

        Ok(ModuleManifest {
            name,
            version,
            description,
            native: self.native,
            author: self.author,
            license: self.license,
            repository: self.repository,
            includes: self.includes,
            libraries,
            source_files: self.source_files,
            custom_code,
            functions,
            bundled: self.bundled,
            bundle_info,
            dependencies,
            entrypoints,
            ignored_platform_keys,
            root_dir: PathBuf::from("."),
        })
    }
}

fn validate_module_name(name: &str) -> Result<String, ManifestError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ManifestError::InvalidField {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }
    if trimmed.starts_with(RESERVED_NAME_PREFIX) {
        return Err(ManifestError::InvalidField {
            field: "name",
            reason: format!("`{trimmed}` must not start with `{RESERVED_NAME_PREFIX}`"),
        });
    }
    if !MODULE_NAME_RE.is_match(trimmed) {
        return Err(ManifestError::InvalidField {
            field: "name",
            reason: format!("`{trimmed}` is not an identifier"),
        });
    }
    Ok(trimmed.to_string())
}

fn keyed_by_platform<V>(
    entries: BTreeMap<String, V>,
    ignored: &mut BTreeSet<String>,
) -> BTreeMap<Platform, V> {
    let mut keyed = BTreeMap::new();
    for (key, value) in entries {
        match parse_platform(&key) {
            Ok(platform) => {
                keyed.insert(platform, value);
            }
            Err(_) => {
                ignored.insert(key);
            }
        }
    }
    keyed
}

fn validate_functions(
    raw: BTreeMap<String, RawFunction>,
    native: bool,
) -> Result<BTreeMap<String, FunctionSpec>, ManifestError> {
    let mut symbols = BTreeSet::new();
    let mut functions = BTreeMap::new();

    for (name, function) in raw {
        let invalid = |reason: String| ManifestError::InvalidFunctionSpec {
            function: name.clone(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("function name must not be empty".to_string()));
        }

        let cpp_name = match function.cpp_name.map(|value| value.trim().to_string()) {
            Some(symbol) if symbol.is_empty() => {
                return Err(invalid("`cpp_name` must not be empty".to_string()));
            }
            Some(symbol) => {
                if !C_IDENTIFIER_RE.is_match(&symbol) {
                    return Err(invalid(format!(
                        "`cpp_name` `{symbol}` is not a C identifier"
                    )));
                }
                if !symbols.insert(symbol.clone()) {
                    return Err(invalid(format!("`cpp_name` `{symbol}` is declared twice")));
                }
                Some(symbol)
            }
            None if native => return Err(invalid("missing `cpp_name`".to_string())),
            None => None,
        };

        let mut param_names = BTreeSet::new();
        let mut params = Vec::with_capacity(function.params.len());
        for param in function.params {
            let ty = parse_semantic_type(&param.ty)
                .map_err(|err| invalid(format!("parameter `{}`: {err}", param.name)))?;
            if !ty.is_value_type() {
                return Err(invalid(format!(
                    "parameter `{}` cannot have type `void`",
                    param.name
                )));
            }
            if !param_names.insert(param.name.clone()) {
                return Err(invalid(format!("parameter `{}` is declared twice", param.name)));
            }
            params.push(ParamSpec {
                name: param.name,
                ty,
            });
        }

        let returns = match function.returns {
            Some(raw) => ReturnSpec {
                ty: parse_semantic_type(&raw.ty)
                    .map_err(|err| invalid(format!("return value: {err}")))?,
                description: raw.description,
            },
            None => ReturnSpec::void(),
        };

        functions.insert(
            name.clone(),
            FunctionSpec {
                description: function.description,
                cpp_name,
                params,
                returns,
            },
        );
    }

    Ok(functions)
}

fn validate_entrypoints(raw: RawEntrypoints) -> Result<ModuleEntrypoints, ManifestError> {
    let check = |field: &'static str, value: Option<String>| -> Result<Option<String>, ManifestError> {
        match value.map(|symbol| symbol.trim().to_string()) {
            Some(symbol) if !C_IDENTIFIER_RE.is_match(&symbol) => Err(ManifestError::InvalidField {
                field,
                reason: format!("`{symbol}` is not a C identifier"),
            }),
            other => Ok(other),
        }
    };
    Ok(ModuleEntrypoints {
        init: check("entrypoints.init", raw.init)?,
        dispose: check("entrypoints.dispose", raw.dispose)?,
    })
}
