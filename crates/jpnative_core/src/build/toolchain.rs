//! C++ toolchain abstraction and subprocess runner.
//!
//! # Responsibility
//! - Define the seam the build driver compiles and links through.
//! - Drive real compilers as cancellable subprocesses.
//! - Discover a usable compiler for the configured target.
//!
//! # Invariants
//! - A cancelled tool run kills its subprocess before returning `Cancelled`.
//! - Diagnostics always carry both stdout and stderr of the failed step.

use crate::build::BuildError;
use crate::cancel::CancellationToken;
use crate::config::LoaderConfig;
use crate::platform::Platform;
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::fmt::{Debug, Display, Formatter};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Inputs of one compile step.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub source: &'a Path,
    pub object: &'a Path,
    pub include_dirs: &'a [PathBuf],
    pub cxx_standard: &'a str,
    pub extra_flags: &'a [String],
}

/// Inputs of one link step.
#[derive(Debug, Clone, Copy)]
pub struct LinkRequest<'a> {
    pub objects: &'a [PathBuf],
    pub output: &'a Path,
    pub link_flags: &'a [String],
}

/// Something that can turn a translation unit into a shared library.
pub trait Toolchain: Send + Sync + Debug {
    /// Stable identity recorded next to produced artifacts.
    fn fingerprint(&self) -> String;

    /// # Errors
    /// - `CompilationFailed` with compiler diagnostics.
    /// - `Cancelled` when `cancel` fired while the compiler ran.
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError>;

    /// # Errors
    /// - `LinkFailed` with linker diagnostics (unresolved libraries land here).
    /// - `Cancelled` when `cancel` fired while the linker ran.
    fn link(&self, request: &LinkRequest<'_>, cancel: &CancellationToken)
        -> Result<(), BuildError>;
}

/// Command-line conventions of a compiler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFamily {
    Gnu,
    Clang,
    Msvc,
}

impl CompilerFamily {
    /// Guesses the family from a compiler path, e.g. `/usr/bin/clang++-17`.
    pub fn from_program(program: &Path) -> Self {
        let stem = program
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if stem == "cl" || stem == "clang-cl" {
            Self::Msvc
        } else if stem.contains("clang") {
            Self::Clang
        } else {
            Self::Gnu
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gnu => "gnu",
            Self::Clang => "clang",
            Self::Msvc => "msvc",
        }
    }
}

impl Display for CompilerFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Toolchain backed by an installed compiler driver.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    program: PathBuf,
    family: CompilerFamily,
    target: Platform,
    poll_interval: Duration,
}

impl CommandToolchain {
    pub fn new(program: impl Into<PathBuf>, target: Platform, poll_interval: Duration) -> Self {
        let program = program.into();
        let family = CompilerFamily::from_program(&program);
        Self {
            program,
            family,
            target,
            poll_interval,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn family(&self) -> CompilerFamily {
        self.family
    }

    fn linker_program(&self) -> PathBuf {
        match self.family {
            CompilerFamily::Msvc => self.program.with_file_name("link.exe"),
            CompilerFamily::Gnu | CompilerFamily::Clang => self.program.clone(),
        }
    }

    fn compile_command(&self, request: &CompileRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.family {
            CompilerFamily::Msvc => {
                cmd.args(["/nologo", "/EHsc"])
                    .arg(format!("/std:{}", request.cxx_standard))
                    .arg("/c")
                    .arg(request.source)
                    .arg(prefixed_path("/Fo", request.object));
                for dir in request.include_dirs {
                    cmd.arg(prefixed_path("/I", dir));
                }
            }
            CompilerFamily::Gnu | CompilerFamily::Clang => {
                cmd.arg(format!("-std={}", request.cxx_standard));
                if self.target != Platform::Windows {
                    cmd.arg("-fPIC");
                }
                cmd.arg("-c")
                    .arg(request.source)
                    .arg("-o")
                    .arg(request.object);
                for dir in request.include_dirs {
                    cmd.arg(prefixed_path("-I", dir));
                }
            }
        }
        cmd.args(request.extra_flags);
        cmd
    }

    fn link_command(&self, request: &LinkRequest<'_>) -> Command {
        let mut cmd = Command::new(self.linker_program());
        match self.family {
            CompilerFamily::Msvc => {
                cmd.args(["/nologo", "/DLL"])
                    .arg(prefixed_path("/OUT:", request.output))
                    .args(request.objects);
            }
            CompilerFamily::Gnu | CompilerFamily::Clang => {
                let shared = if self.target == Platform::Macos {
                    "-dynamiclib"
                } else {
                    "-shared"
                };
                cmd.arg(shared)
                    .args(request.objects)
                    .arg("-o")
                    .arg(request.output);
            }
        }
        cmd.args(request.link_flags);
        cmd
    }
}

impl Toolchain for CommandToolchain {
    fn fingerprint(&self) -> String {
        format!("{}:{}", self.family, self.program.display())
    }

    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let output = run_tool(self.compile_command(request), cancel, self.poll_interval)?;
        if output.status.success() {
            return Ok(());
        }
        Err(BuildError::CompilationFailed {
            diagnostics: output.diagnostics,
        })
    }

    fn link(
        &self,
        request: &LinkRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let output = run_tool(self.link_command(request), cancel, self.poll_interval)?;
        if output.status.success() {
            return Ok(());
        }
        Err(BuildError::LinkFailed {
            diagnostics: output.diagnostics,
        })
    }
}

fn prefixed_path(prefix: &str, path: &Path) -> OsString {
    let mut value = OsString::from(prefix);
    value.push(path.as_os_str());
    value
}

/// Result of a finished tool subprocess.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// stdout followed by stderr, trimmed.
    pub diagnostics: String,
}

/// Kills the wrapped child unless it already exited.
struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

/// Runs `cmd` to completion, polling `cancel` every `poll_interval`.
///
/// # Errors
/// - `ToolchainUnavailable` when the program cannot be started.
/// - `Cancelled` when `cancel` fired; the subprocess has been killed.
pub fn run_tool(
    mut cmd: Command,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> Result<ToolOutput, BuildError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("event=tool_spawn module=build status=start program={program}");

    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            BuildError::ToolchainUnavailable(format!("failed to start `{program}`: {err}"))
        })?;
    let mut child = KillOnDrop(child);

    let stdout = drain(child.0.stdout.take());
    let stderr = drain(child.0.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            info!("event=tool_cancel module=build status=ok program={program}");
            drop(child);
            return Err(BuildError::Cancelled);
        }
        match child.0.wait_timeout(poll_interval) {
            Ok(Some(status)) => break status,
            Ok(None) => continue,
            Err(source) => {
                return Err(BuildError::Io {
                    context: format!("waiting for `{program}`"),
                    source,
                })
            }
        }
    };

    let mut diagnostics = collect(stdout);
    let stderr = collect(stderr);
    if !stderr.is_empty() {
        if !diagnostics.is_empty() {
            diagnostics.push('\n');
        }
        diagnostics.push_str(&stderr);
    }
    if !status.success() {
        warn!("event=tool_exit module=build status=error program={program} exit={status}");
    }
    Ok(ToolOutput {
        status,
        diagnostics: diagnostics.trim().to_string(),
    })
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
        });
    }
    rx
}

fn collect(rx: mpsc::Receiver<String>) -> String {
    rx.recv().unwrap_or_default().trim_end().to_string()
}

fn host_candidates(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Windows => &["cl.exe", "clang++.exe", "g++.exe"],
        Platform::Linux => &["c++", "g++", "clang++"],
        Platform::Macos => &["clang++", "c++"],
    }
}

/// Locates `name` in the directories of `path_var` (a `PATH`-style list).
pub fn find_in_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Picks the compiler for `config.target`.
///
/// An explicit `config.compiler` always wins. Otherwise the host `PATH` is
/// searched, which only makes sense when building for the host platform.
///
/// # Errors
/// - `ToolchainUnavailable` when nothing usable is configured or found.
pub fn detect_toolchain(config: &LoaderConfig) -> Result<CommandToolchain, BuildError> {
    if let Some(compiler) = &config.compiler {
        let toolchain = CommandToolchain::new(compiler, config.target, config.poll_interval);
        info!(
            "event=toolchain_detect module=build status=ok source=config family={} program={}",
            toolchain.family(),
            toolchain.program().display()
        );
        return Ok(toolchain);
    }

    if Platform::host() != Some(config.target) {
        return Err(BuildError::ToolchainUnavailable(format!(
            "no compiler configured for cross target `{}`; set JPNATIVE_CXX",
            config.target
        )));
    }

    let path_var = std::env::var_os("PATH");
    let candidates = host_candidates(config.target);
    for name in candidates {
        if let Some(program) = find_in_path(name, path_var.as_deref()) {
            let toolchain = CommandToolchain::new(program, config.target, config.poll_interval);
            info!(
                "event=toolchain_detect module=build status=ok source=path family={} program={}",
                toolchain.family(),
                toolchain.program().display()
            );
            return Ok(toolchain);
        }
    }

    Err(BuildError::ToolchainUnavailable(format!(
        "no C++ compiler found on PATH (tried {})",
        candidates.join(", ")
    )))
}
