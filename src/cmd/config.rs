//! Configuration view and validation commands: `roundtable config`.

use std::path::Path;

use anyhow::Result;

use roundtable::config::RoundTableConfig;

use super::super::ConfigCommands;

/// Hide all but the last four characters of a secret.
fn mask_secret(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", visible)
    }
}

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Round Table Configuration");
            println!("=========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No config file at {}; using defaults",
                    config_path.display()
                );
            }
            println!();

            let mut config = RoundTableConfig::load_or_default(config_path)?;
            config.apply_env()?;

            println!("Effective values (with env overrides):");
            println!("[server]");
            println!("  host = \"{}\"", config.server.host);
            println!("  port = {}", config.server.port);
            println!("  db_path = \"{}\"", config.server.db_path.display());
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();
            println!("[llm]");
            println!("  provider = \"{}\"", config.llm.provider);
            println!("  model = \"{}\"", config.llm.model_name());
            if let Some(endpoint) = &config.llm.endpoint {
                println!("  endpoint = \"{}\"", endpoint);
            }
            match &config.llm.api_key {
                Some(key) => println!("  api_key = \"{}\"", mask_secret(key)),
                None => println!("  api_key = (not set)"),
            }
            println!("  temperature = {}", config.llm.temperature);
            if let Some(max_tokens) = config.llm.max_tokens {
                println!("  max_tokens = {}", max_tokens);
            }
            println!("  timeout_secs = {}", config.llm.timeout_secs);
            println!();
            println!("[kamiwaza]");
            match &config.kamiwaza.api_uri {
                Some(uri) => println!("  api_uri = \"{}\"", uri),
                None => println!("  api_uri = (not set)"),
            }
            println!();
            println!("[logging]");
            println!("  filter = \"{}\"", config.logging.filter);
            println!("  json = {}", config.logging.json);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let mut config = RoundTableConfig::load_or_default(config_path)?;
            config.apply_env()?;
            match config.llm.validate() {
                Ok(()) => println!(
                    "{} provider '{}' is ready",
                    console::style("Configuration valid:").green().bold(),
                    config.llm.provider
                ),
                Err(e) => {
                    println!("{} {}", console::style("Configuration invalid:").red().bold(), e);
                    return Err(e);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!(
                    "{} {} already exists",
                    console::style("⚠").yellow(),
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            RoundTableConfig::default().save(config_path)?;
            println!(
                "{} {}",
                console::style("Created").green(),
                config_path.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-abcdef123456"), "****3456");
        assert_eq!(mask_secret("abc"), "****");
    }

    #[test]
    fn test_init_writes_default_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtable.toml");
        cmd_config(&path, Some(ConfigCommands::Init)).unwrap();
        let written = RoundTableConfig::load(&path).unwrap();
        assert_eq!(written.server.port, RoundTableConfig::default().server.port);

        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        cmd_config(&path, Some(ConfigCommands::Init)).unwrap();
        assert_eq!(RoundTableConfig::load(&path).unwrap().server.port, 9100);
    }
}
