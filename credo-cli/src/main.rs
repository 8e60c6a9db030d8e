//! Credo CLI: run the registered reference models from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Credo: train and evaluate heterogeneous models through one harness
#[derive(Parser, Debug)]
#[command(name = "credo", version, about, long_about = None)]
struct Cli {
    /// Run configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List registered models
    List,
    /// Train a model, validate every epoch, then score the test split
    Run(RunArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Registered model name (see `credo list`)
    model: String,

    /// Number of training epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Examples per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Device: cpu, cuda, cuda:N, metal, metal:N
    #[arg(short, long)]
    device: Option<String>,

    /// Global seed for data, initialization, shuffling and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Keep the best checkpoint
    #[arg(long)]
    saved: bool,

    /// Directory for checkpoints
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the fully resolved run configuration as TOML
    Show,
    /// Print the user configuration file location
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "credo", "credo")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "credo.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "credo", "-vv", "run", "text_mlp", "--epochs", "3", "--device", "cuda:1", "--saved",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.model, "text_mlp");
                assert_eq!(args.epochs, Some(3));
                assert_eq!(args.device.as_deref(), Some("cuda:1"));
                assert!(args.saved);
                assert_eq!(args.seed, None);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["credo", "config", "show", "--config", "run.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }

    #[test]
    fn test_run_requires_model() {
        assert!(Cli::try_parse_from(["credo", "run"]).is_err());
    }
}
