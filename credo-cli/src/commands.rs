//! Subcommand handlers.

use crate::{Commands, ConfigAction, RunArgs};
use anyhow::Context;
use credo_core::{CancellationToken, ConfigOverrides, RunConfig, RunStatus, load_run_config};
use std::path::Path;
use tracing::{info, warn};

pub async fn handle_command(command: Commands, config_file: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::List => {
            let registry = credo_models::builtin_registry()?;
            for (name, model) in registry.iter() {
                println!("{name:<12} {}", model.description);
            }
            Ok(())
        }
        Commands::Run(args) => run(args, config_file).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_run_config(config_file, &ConfigOverrides::default())
                    .context("Configuration error")?;
                print!("{}", render_toml(&config)?);
                Ok(())
            }
            ConfigAction::Path => {
                match credo_core::config::user_config_path() {
                    Some(path) => println!("{}", path.display()),
                    None => println!("(no home directory; user config disabled)"),
                }
                Ok(())
            }
        },
    }
}

async fn run(args: RunArgs, config_file: Option<&Path>) -> anyhow::Result<()> {
    let overrides = overrides_from(&args);
    let config = load_run_config(config_file, &overrides).context("Configuration error")?;
    let registry = credo_models::builtin_registry()?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    info!(model = %args.model, "Starting run");
    let model = args.model.clone();
    let outcome =
        tokio::task::spawn_blocking(move || registry.run(&model, &config, &cancel)).await;
    interrupt.abort();
    let summary = outcome
        .context("training task panicked")?
        .with_context(|| format!("run of '{}' failed", args.model))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for record in &summary.fit.history {
            let metrics = record
                .metrics
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            println!(
                "epoch {:>3}  train_loss={}  val_loss={}  {metrics}{}",
                record.epoch,
                fmt_loss(record.train_loss),
                fmt_loss(record.val_loss),
                if record.checkpointed { "  *" } else { "" }
            );
        }
        println!("{summary}");
        if let Some(best) = &summary.fit.best {
            println!("checkpoint: {}", best.weights_path.display());
        }
    }

    if summary.fit.status == RunStatus::Cancelled {
        anyhow::bail!("run cancelled after {} epoch(s)", summary.fit.epochs_completed);
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C. Training stops after the batch in
/// flight and the best checkpoint so far is kept.
async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupt received, stopping after the current batch");
        token.cancel();
    }
}

fn overrides_from(args: &RunArgs) -> ConfigOverrides {
    ConfigOverrides {
        epochs: args.epochs,
        batch_size: args.batch_size,
        device: args.device.clone(),
        seed: args.seed,
        saved: args.saved.then_some(true),
        save_dir: args.save_dir.clone(),
    }
}

fn render_toml(config: &RunConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("failed to render configuration")
}

fn fmt_loss(loss: Option<f64>) -> String {
    loss.map_or_else(|| "-".to_string(), |l| format!("{l:.4}"))
}
