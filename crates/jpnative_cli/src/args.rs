use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "jpnative")]
#[command(about = "Inspect and load JP native extension modules", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// Print the core crate version
    Version,
    /// Validate a manifest and print a summary without building
    Inspect {
        /// Path to module.json
        path: PathBuf,
    },
    /// Build, bind and register a module, then print its registry info as JSON
    Load {
        /// Path to module.json
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["jpnative", "inspect", "sdl/module.json"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Inspect {
                path: PathBuf::from("sdl/module.json")
            })
        );

        let cli = Cli::try_parse_from(["jpnative", "load", "math/module.json"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Load {
                path: PathBuf::from("math/module.json")
            })
        );

        assert_eq!(Cli::try_parse_from(["jpnative"]).unwrap().command, None);
        assert_eq!(
            Cli::try_parse_from(["jpnative", "version"]).unwrap().command,
            Some(Commands::Version)
        );
    }

    #[test]
    fn load_requires_a_path() {
        assert!(Cli::try_parse_from(["jpnative", "load"]).is_err());
        assert!(Cli::try_parse_from(["jpnative", "build", "x"]).is_err());
    }
}
