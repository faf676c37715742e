//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                  |
//! |-----------|---------------------------------------------------|
//! | `serve`   | `Serve`, `InitDb`                                 |
//! | `config`  | `Config`                                          |
//! | `board`   | `Board`, `Send`, `Connection`, `Stats`            |

pub mod board;
pub mod config;
pub mod serve;

pub use board::{cmd_board, cmd_connection, cmd_send, cmd_stats};
pub use config::cmd_config;
pub use serve::{cmd_init_db, cmd_serve};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use zapboard::board::cache::QueryCache;
use zapboard::board::db::DbHandle;
use zapboard::board::models::Principal;
use zapboard::board::server::open_database;
use zapboard::board::service::LeadBoard;
use zapboard::board::store::LocalStore;
use zapboard::board::webhooks::WebhookClient;
use zapboard::config::{DEFAULT_CONFIG_DIR, ZapboardConfig};

use super::Cli;

pub fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// File, then environment, then command-line flags.
pub fn load_config(cli: &Cli) -> Result<ZapboardConfig> {
    let mut config = ZapboardConfig::load_or_default(&config_dir(cli))?;
    for warning in config.apply_env() {
        tracing::warn!("{}", warning);
    }
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    Ok(config)
}

/// Build a `LeadBoard` over the configured database.
pub fn open_board(config: &ZapboardConfig) -> Result<LeadBoard> {
    let db = open_database(&config.database.path)?;
    let store = LocalStore::new(DbHandle::new(db));
    let webhooks = WebhookClient::new(config.webhook_timeout())?;
    Ok(LeadBoard::new(
        Arc::new(store),
        Arc::new(QueryCache::new()),
        webhooks,
        config.board_settings(),
    ))
}

/// Print the success toasts a command produced. Failures are reported by
/// the returned error instead.
pub fn flush_notifications(board: &LeadBoard, user: &Principal) {
    use zapboard::board::sync::NoticeLevel;

    for notice in board.notifications().drain(&user.user_id) {
        if notice.level == NoticeLevel::Success {
            println!("{}", notice.message);
        }
    }
}
