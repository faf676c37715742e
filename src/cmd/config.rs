//! Configuration view and validation commands: `zapboard config`.

use anyhow::Result;

use zapboard::config::{CONFIG_FILE_NAME, ZapboardConfig, user_config_path};

use super::super::{Cli, ConfigCommands};
use super::config_dir;

pub fn cmd_config(
    cli: &Cli,
    config: &ZapboardConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = config_dir(cli).join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else if let Some(user_path) = user_config_path().filter(|p| p.exists()) {
                println!("# Config file: {}", user_path.display());
            } else {
                println!("# No {} found; using defaults", CONFIG_FILE_NAME);
            }
            println!("# Effective values (with env/CLI overrides)");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ZapboardConfig::default().save(&config_path)?;
            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
        }
    }

    Ok(())
}
