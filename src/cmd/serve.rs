//! Server commands: `roundtable serve` and `roundtable init-db`.

use std::path::PathBuf;

use anyhow::Result;

use roundtable::config::RoundTableConfig;
use roundtable::roundtable::server;

/// Command-line flags win over the config file and environment.
pub fn apply_serve_overrides(
    config: &mut RoundTableConfig,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if dev {
        config.server.dev_mode = true;
    }
}

pub async fn cmd_serve(config: RoundTableConfig) -> Result<()> {
    config.llm.validate()?;
    println!(
        "{} http://{}:{} ({} / {})",
        console::style("Round table server starting at").bold(),
        config.server.host,
        config.server.port,
        config.llm.provider,
        config.llm.model_name()
    );
    server::start_server(config).await
}

pub fn cmd_init_db(config: &RoundTableConfig) -> Result<()> {
    server::open_database(config)?;
    println!(
        "{} {}",
        console::style("Database initialized at").green(),
        config.server.db_path.display()
    );
    Ok(())
}
