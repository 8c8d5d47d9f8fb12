//! Configuration commands: `omnigen config`.

use anyhow::Result;
use std::path::Path;

use crate::ConfigCommands;
use omnigen::config::{CliOverrides, Settings};

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();

            let settings = Settings::resolve(config_path, &CliOverrides::default())?;
            print!("{}", settings.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let settings = Settings::resolve(config_path, &CliOverrides::default())?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite it.",
                    config_path.display()
                );
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            Settings::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
