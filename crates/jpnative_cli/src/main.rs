//! Command-line front end for the native module loader.
//!
//! # Responsibility
//! - `jpnative` prints the core version.
//! - `jpnative inspect <module.json>` validates a manifest and summarizes it.
//! - `jpnative load <module.json>` builds, binds and registers a module, then
//!   prints its registry info as JSON.
//!
//! Loader settings come from `JPNATIVE_*` environment variables.

mod args;

use args::{Cli, Commands};
use clap::Parser;
use jpnative_core::{logging, LoaderConfig, ModuleLoadService, ModuleManifest};
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match &cli.command {
        None | Some(Commands::Version) => {
            println!("jpnative_core version={}", jpnative_core::core_version());
            Ok(())
        }
        Some(Commands::Inspect { path }) => inspect(path),
        Some(Commands::Load { path }) => load(path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn inspect(path: &Path) -> Result<(), String> {
    let manifest = jpnative_core::load_file(path).map_err(|err| err.to_string())?;
    print_summary(&manifest);
    Ok(())
}

fn print_summary(manifest: &ModuleManifest) {
    println!("name={} version={}", manifest.name, manifest.version);
    println!("description={}", manifest.description);
    println!(
        "native={} bundled={} sources={}",
        manifest.native,
        manifest.bundled,
        manifest.source_files.len()
    );
    for (name, spec) in &manifest.functions {
        println!("function {name}: {}", spec.signature(name));
    }
    for key in &manifest.ignored_platform_keys {
        println!("ignored platform key: {key}");
    }
}

fn load(path: &Path) -> Result<(), String> {
    let config = LoaderConfig::from_env().map_err(|err| err.to_string())?;
    logging::init_logging_for(&config)?;

    let service = ModuleLoadService::new(config).map_err(|err| err.to_string())?;
    let module = service.load_file(path).map_err(|err| err.to_string())?;
    let info = serde_json::to_string_pretty(&module.info()).map_err(|err| err.to_string())?;
    println!("{info}");

    service.registry().unload_all();
    Ok(())
}
