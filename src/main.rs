use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use anaplan_sync::config::{CliArgs, Command, Config};
use anaplan_sync::model::{AnaplanModel, CellWrite};
use anaplan_sync::tasks::WaitOptions;

mod setup;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;

    // Initialize logging with the configured level; RUST_LOG wins
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Configuration: {:?}", config);

    if args.command == Command::Setup {
        return setup::run_interactive_setup(&config).await;
    }

    let model = config.model()?;

    // Fail fast on bad credentials before touching the model
    let token = model.authenticate().await.context("Authentication failed")?;
    tracing::info!("Authenticated (token valid until {})", token.expires_at());

    run_command(&model, args.command).await
}

async fn run_command(model: &AnaplanModel, command: Command) -> Result<()> {
    match command {
        Command::Setup => Ok(()),

        Command::List { kind } => {
            let items = model.list(kind).await?;
            tracing::info!("{} {}", items.len(), kind);
            print_json(&serde_json::Value::Array(items))
        }

        Command::Run {
            action_id,
            wait,
            interval,
            timeout,
        } => {
            if !wait {
                let response = model.run(&action_id).await?;
                return print_json(&response);
            }

            let options = WaitOptions {
                interval: Duration::from_secs(interval),
                timeout: Duration::from_secs(timeout),
            };
            let detail = model.run_and_wait(&action_id, options).await?;
            tracing::info!(
                "Task {} finished: {} ({:?})",
                detail.task_id,
                detail.task_state,
                detail.outcome()
            );
            print_json(&detail.raw)
        }

        Command::Status { action_id } => {
            let state = model.status(&action_id).await?;
            println!("{}", state);
            Ok(())
        }

        Command::Monitor { action_id } => {
            let detail = model.monitor(&action_id).await?;
            print_json(&detail.raw)
        }

        Command::ReadView { view_id } => {
            let data = model.read_view(&view_id).await?;
            print_json(&data)
        }

        Command::WriteCells { module_id, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let cells: Vec<CellWrite> = serde_json::from_str(&text)
                .with_context(|| format!("Invalid cell list in {}", file.display()))?;

            let response = model.write_cells(&module_id, &cells).await?;
            print_json(&response)
        }

        Command::Upload { file_id, path } => {
            let report = model.upload(&file_id, &path).await?;
            tracing::info!(
                "Uploaded {} ({} bytes, {} chunks) to file {}",
                report.path.display(),
                report.bytes,
                report.chunk_count,
                report.file_id
            );
            print_json(&report.response)
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
