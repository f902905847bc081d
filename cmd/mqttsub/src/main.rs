//! mqttsub - subscribe to and publish on an MQTT broker.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{PubCommand, SubCommand};

/// mqttsub - a small MQTT 3.1.1 client.
///
/// Connects to a broker, keeps the session alive and reconnects with
/// backoff when the connection drops, replaying subscriptions.
///
/// Broker settings come from --config (YAML) when given; flags override
/// individual fields.
#[derive(Parser)]
#[command(name = "mqttsub")]
#[command(about = "MQTT subscribe/publish tool")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML ClientConfig)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Broker host [default: localhost]
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Broker port [default: 1883]
    #[arg(short = 'p', long, global = true)]
    pub port: Option<u16>,

    /// Keep-alive interval in seconds, 0 disables [default: 60]
    #[arg(short = 'k', long = "keep-alive", global = true)]
    pub keep_alive: Option<u16>,

    /// Client identifier (random when omitted)
    #[arg(short = 'i', long = "client-id", global = true)]
    pub client_id: Option<String>,

    /// Username
    #[arg(short = 'u', long, global = true)]
    pub username: Option<String>,

    /// Password
    #[arg(short = 'P', long, global = true, requires = "username")]
    pub password: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe and print every message until Ctrl-C
    Sub(SubCommand),
    /// Publish a single message
    Pub(PubCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Sub(cmd) => cmd.run(&cli).await,
        Commands::Pub(cmd) => cmd.run(&cli).await,
    }
}
