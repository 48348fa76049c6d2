//! tracksweep operator CLI.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "tracksweep")]
#[command(about = "Run retention for MLflow-style tracking servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single GC pass now
    Gc {
        /// Report eligible runs without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect cloud credentials
    Credentials {
        #[command(subcommand)]
        command: CredentialCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Resolve configuration and print it with secrets redacted
    Check,
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Resolve the credential chain and fetch one access token
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gc { dry_run } => {
            commands::gc::run_once(dry_run).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Check => {
                commands::config::check()?;
            }
        },
        Commands::Credentials { command } => match command {
            CredentialCommands::Check => {
                commands::credentials::check().await?;
            }
        },
    }

    Ok(())
}
