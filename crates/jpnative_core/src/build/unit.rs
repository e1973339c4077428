//! Translation unit assembly.
//!
//! # Responsibility
//! - Turn a manifest into one self-contained C++ translation unit per platform.
//! - Derive the content hash that keys the build cache.
//!
//! # Invariants
//! - C-linkage export declarations come first, so user definitions that follow
//!   inherit C linkage and export under their unmangled `cpp_name`.
//! - Order after the declarations: includes, source files (declaration order),
//!   then `custom_code`.

use crate::build::BuildError;
use crate::manifest::{FunctionSpec, ModuleManifest};
use crate::platform::Platform;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Assembled compilation input for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    pub module_name: String,
    pub platform: Platform,
    /// Full C++ source handed to the compiler.
    pub source: String,
    /// Header search directories (module root, then each source file's directory).
    pub include_dirs: Vec<PathBuf>,
    /// Linker flags for `platform`.
    pub link_flags: Vec<String>,
}

impl CompilationUnit {
    /// Reads source files and assembles the translation unit.
    ///
    /// # Errors
    /// - `SourceUnreadable` when a declared source file cannot be read.
    pub fn assemble(manifest: &ModuleManifest, platform: Platform) -> Result<Self, BuildError> {
        let mut source = String::new();
        let _ = writeln!(
            source,
            "// jpnative translation unit for module `{}` ({platform})",
            manifest.name
        );

        let export = export_prefix(platform);
        for (_, spec, symbol) in manifest.native_functions() {
            let _ = writeln!(source, "{export} {};", export_declaration(spec, symbol));
        }
        for symbol in manifest.entrypoints.symbols() {
            let _ = writeln!(source, "{export} void {symbol}(void);");
        }

        for include in &manifest.includes {
            let _ = writeln!(source, "#include {}", include_reference(include));
        }

        let mut include_dirs = vec![manifest.root_dir.clone()];
        for relative in &manifest.source_files {
            let path = manifest.resolve_path(relative);
            let text =
                std::fs::read_to_string(&path).map_err(|err| BuildError::SourceUnreadable {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;
            if let Some(parent) = path.parent() {
                let parent = parent.to_path_buf();
                if !include_dirs.contains(&parent) {
                    include_dirs.push(parent);
                }
            }
            let _ = writeln!(source, "#line 1 \"{}\"", escape_line_path(relative));
            source.push_str(&text);
            if !text.ends_with('\n') {
                source.push('\n');
            }
        }

        if let Some(code) = &manifest.custom_code {
            let _ = writeln!(source, "#line 1 \"{}.custom_code\"", manifest.name);
            source.push_str(code);
            if !code.ends_with('\n') {
                source.push('\n');
            }
        }

        Ok(Self {
            module_name: manifest.name.clone(),
            platform,
            source,
            include_dirs,
            link_flags: manifest.link_flags(platform).to_vec(),
        })
    }

    /// Content hash over everything that changes the produced library.
    ///
    /// `compiler_settings` covers toolchain fingerprint, language standard and
    /// extra flags.
    pub fn cache_key(&self, compiler_settings: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, "kind", b"compiled");
        hash_field(&mut hasher, "module", self.module_name.as_bytes());
        hash_field(&mut hasher, "platform", self.platform.as_str().as_bytes());
        hash_field(&mut hasher, "source", self.source.as_bytes());
        for dir in &self.include_dirs {
            hash_field(&mut hasher, "include_dir", dir.to_string_lossy().as_bytes());
        }
        for flag in &self.link_flags {
            hash_field(&mut hasher, "link_flag", flag.as_bytes());
        }
        for setting in compiler_settings {
            hash_field(&mut hasher, "compiler_setting", setting.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Cache key for a bundled artifact: module, platform and declared file set.
pub fn bundle_cache_key(module_name: &str, platform: Platform, paths: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    hash_field(&mut hasher, "kind", b"bundled");
    hash_field(&mut hasher, "module", module_name.as_bytes());
    hash_field(&mut hasher, "platform", platform.as_str().as_bytes());
    for path in paths {
        hash_field(&mut hasher, "file", path.to_string_lossy().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn hash_field(hasher: &mut Sha256, label: &str, bytes: &[u8]) {
    hasher.update(label.as_bytes());
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn export_prefix(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "extern \"C\" __declspec(dllexport)",
        Platform::Linux | Platform::Macos => {
            "extern \"C\" __attribute__((visibility(\"default\")))"
        }
    }
}

fn export_declaration(spec: &FunctionSpec, symbol: &str) -> String {
    let params = if spec.params.is_empty() {
        "void".to_string()
    } else {
        spec.params
            .iter()
            .map(|param| param.ty.cpp_type())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("{} {symbol}({params})", spec.returns.ty.cpp_type())
}

/// Accepts `<header>`, `"header"` or a bare name (treated as `<name>`).
fn include_reference(include: &str) -> String {
    let trimmed = include.trim();
    if trimmed.starts_with('<') || trimmed.starts_with('"') {
        trimmed.to_string()
    } else {
        format!("<{trimmed}>")
    }
}

fn escape_line_path(path: &str) -> String {
    path.replace('\\', "/").replace('"', "\\\"")
}
