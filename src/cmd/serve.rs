//! Dashboard server commands: `zapboard serve` and `zapboard init-db`.

use anyhow::Result;

use zapboard::board::server::{open_database, start_server};
use zapboard::config::ZapboardConfig;

pub async fn cmd_serve(
    mut config: ZapboardConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if dev {
        config.server.dev_mode = true;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(config.to_server_config()).await
}

pub fn cmd_init_db(config: &ZapboardConfig) -> Result<()> {
    let path = &config.database.path;
    open_database(path)?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
