use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "zapboard")]
#[command(version, about = "WhatsApp business dashboard: lead board, inbox and automation relay")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding zapboard.toml (defaults to .zapboard)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Database path. Overrides zapboard.toml and ZAPBOARD_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and realtime feed
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a separately served front-end)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations, then exit
    InitDb,
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect and rearrange a user's lead board
    Board {
        #[command(subcommand)]
        command: BoardCommands,
    },
    /// Send a WhatsApp message through the send_message webhook
    Send {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        conversation: i64,
        /// Connection (instance) to send from
        #[arg(long)]
        instance: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Attach a local file; only its name and size are checked here
        #[arg(long)]
        attach: Option<PathBuf>,
    },
    /// Manage WhatsApp connections through automation webhooks
    Connection {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Show dashboard statistics
    Stats {
        #[arg(short, long)]
        user: String,
        /// Keep printing on the configured poll interval until Ctrl+C
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default zapboard.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum BoardCommands {
    /// Print columns and their leads in board order
    Show {
        #[arg(short, long)]
        user: String,
    },
    /// Drop a lead into a column at an index
    Move {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        lead: i64,
        #[arg(long)]
        column: i64,
        #[arg(long, default_value = "0")]
        index: usize,
    },
    /// Convert leads into contacts collected in a new contact list
    Convert {
        #[arg(short, long)]
        user: String,
        /// Lead ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        leads: Vec<i64>,
        #[arg(long)]
        list: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConnectionCommands {
    Create {
        #[arg(short, long)]
        user: String,
        instance: String,
    },
    Delete {
        #[arg(short, long)]
        user: String,
        instance: String,
    },
    /// Request a pairing QR code
    Qr {
        #[arg(short, long)]
        user: String,
        instance: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    zapboard::logging::init_logging(cli.verbose);

    let config = cmd::load_config(&cli)?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host.clone(), *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
        Commands::Board { command } => cmd::cmd_board(&config, command.clone()).await?,
        Commands::Send {
            user,
            conversation,
            instance,
            body,
            attach,
        } => {
            cmd::cmd_send(
                &config,
                user,
                *conversation,
                instance,
                body,
                attach.as_deref(),
            )
            .await?;
        }
        Commands::Connection { command } => cmd::cmd_connection(&config, command.clone()).await?,
        Commands::Stats { user, watch } => cmd::cmd_stats(&config, user, *watch).await?,
    }

    Ok(())
}
