use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sigchat_core::config::Config;
use sigchat_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, warn};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "sigchat")]
#[command(author, version, about = "Signed-message chat: server, keys and client", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; SIGCHAT_* variables override it
    #[arg(short, long, env = "SIGCHAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the delivery server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// SQLite database file
        #[arg(long)]
        database: Option<String>,
    },

    /// Register a user with the key derived from their passphrase
    Register {
        username: String,

        #[arg(long, env = "SIGCHAT_PASSPHRASE", hide_env_values = true)]
        passphrase: String,

        /// SQLite database file
        #[arg(long)]
        database: Option<String>,
    },

    /// Print the key pair derived from a username and passphrase
    Derive {
        username: String,

        #[arg(long, env = "SIGCHAT_PASSPHRASE", hide_env_values = true)]
        passphrase: String,

        /// Also print the private key
        #[arg(long)]
        show_private: bool,
    },

    /// Sign a message and print the envelope as JSON
    Sign {
        /// Sender username
        username: String,

        /// Receiver username
        to: String,

        message: String,

        #[arg(long, env = "SIGCHAT_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },

    /// Verify an envelope read from a file, or stdin when omitted
    Verify {
        envelope: Option<PathBuf>,

        /// Public key JWK file; otherwise the sender's key is fetched from the server
        #[arg(long)]
        public_key: Option<PathBuf>,

        /// Server base URL for key lookups
        #[arg(long)]
        api_url: Option<String>,
    },

    /// Chat with one peer from the terminal
    Chat {
        username: String,

        /// The user to talk to
        peer: String,

        #[arg(long, env = "SIGCHAT_PASSPHRASE", hide_env_values = true)]
        passphrase: String,

        /// WebSocket URL of the delivery server
        #[arg(long)]
        server_url: Option<String>,

        /// Server base URL for key lookups
        #[arg(long)]
        api_url: Option<String>,

        /// Directory for stored conversations
        #[arg(long)]
        conversation_dir: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse::<LogLevel>().unwrap_or_else(|e| {
        eprintln!("{}, using 'info'", e);
        LogLevel::Info
    });
    init_logging_with_config(LogConfig::new(log_level).json_format(args.json_logs))?;

    let mut config = load_config(args.config.as_ref())?;
    debug!(?config, "Configuration loaded");

    match args.command {
        Command::Serve { bind, database } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(database) = database {
                config.store.database_path = Some(expand_path(&database));
            }
            if config.store.database_path.is_none() {
                warn!("No database configured; messages will not survive a restart");
            }
            commands::serve(config).await
        }
        Command::Register { username, passphrase, database } => {
            let path = database
                .map(|d| expand_path(&d))
                .or(config.store.database_path)
                .context("register needs --database or store.database_path")?;
            commands::register(&path, &username, &passphrase).await
        }
        Command::Derive { username, passphrase, show_private } => {
            commands::derive(&username, &passphrase, show_private)
        }
        Command::Sign { username, to, message, passphrase } => {
            commands::sign(&username, &passphrase, &to, &message)
        }
        Command::Verify { envelope, public_key, api_url } => {
            let api_url = api_url.unwrap_or(config.client.api_url);
            commands::verify(envelope.as_deref(), public_key.as_deref(), &api_url).await
        }
        Command::Chat { username, peer, passphrase, server_url, api_url, conversation_dir } => {
            if let Some(url) = server_url {
                config.client.server_url = url;
            }
            if let Some(url) = api_url {
                config.client.api_url = url;
            }
            if let Some(dir) = conversation_dir {
                config.client.conversation_dir = Some(expand_path(&dir));
            }
            config.validate()?;
            commands::chat(config, &username, &passphrase, &peer).await
        }
    }
}
