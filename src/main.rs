use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod replication;

#[cfg(feature = "cli")]
mod cli;

#[cfg(feature = "backend")]
mod db;
#[cfg(feature = "backend")]
mod server;

#[cfg(all(feature = "cli", feature = "backend"))]
use cli::backend;
#[cfg(feature = "cli")]
use cli::{execution, policy, ApiClient};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// URL of the replication backend
    #[arg(long, global = true, env = "REPLICATOR_URL", default_value = cli::DEFAULT_BACKEND_URL)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backend server commands
    #[cfg(feature = "backend")]
    #[command(subcommand)]
    Backend(backend::BackendCommands),
    /// Replication policy commands
    #[command(subcommand)]
    #[command(visible_alias = "p")]
    Policy(policy::PolicyCommands),
    /// Replication execution commands
    #[command(subcommand)]
    #[command(visible_alias = "x")]
    Execution(execution::ExecutionCommands),
}

fn default_log_filter(command: &Commands) -> &'static str {
    match command {
        #[cfg(feature = "backend")]
        Commands::Backend(_) => "info,tower_http=debug",
        _ => "warn",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter(&cli.command).into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = ApiClient::new(Client::new(), &cli.url);
    match cli.command {
        #[cfg(feature = "backend")]
        Commands::Backend(cmd) => backend::handle_backend_command(cmd).await,
        Commands::Policy(cmd) => policy::handle_policy_command(&client, cmd).await,
        Commands::Execution(cmd) => execution::handle_execution_command(&client, cmd).await,
    }
}
