//! Tenure CLI entry point.
//!
//! Binary name: `tenure`
//!
//! Parses CLI arguments, sets up tracing, opens the database in the data
//! directory and dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use console::style;

use cli::definition::Lifecycle;
use cli::instance::StartArgs;
use cli::{Cli, Commands};
use state::AppState;
use tenure_infra::config::default_data_dir;
use tenure_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::from_verbosity(cli.verbose, cli.quiet);
    tracing_options.json = cli.log_json;
    tracing_options.enable_otel = cli.otel;
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Neither completions nor validation need app state
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "tenure", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => {
            return cli::definition::handle_validate(file, cli.json).await;
        }
        _ => {}
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let state = AppState::open(&data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Completions { .. } | Commands::Validate { .. } => {}

        Commands::Import {
            file,
            activate,
            make_default,
        } => {
            cli::definition::handle_import(&state, &file, activate, make_default, json).await?;
        }

        Commands::List { process_type } => {
            cli::definition::handle_list(&state, process_type, json).await?;
        }

        Commands::Activate { code } => {
            cli::definition::handle_lifecycle(&state, &code, Lifecycle::Activate, json).await?;
        }

        Commands::Deactivate { code } => {
            cli::definition::handle_lifecycle(&state, &code, Lifecycle::Deactivate, json).await?;
        }

        Commands::SetDefault { code } => {
            cli::definition::handle_lifecycle(&state, &code, Lifecycle::SetDefault, json).await?;
        }

        Commands::Start {
            code,
            process_type,
            process,
            data,
            vars,
            by,
        } => {
            let args = StartArgs {
                code,
                process_type,
                process,
                data,
                vars,
                by,
            };
            cli::instance::handle_start(&state, args, json).await?;
        }

        Commands::Complete {
            instance,
            step,
            result,
            by,
        } => {
            cli::instance::handle_complete(
                &state,
                &instance,
                &step,
                result.as_deref(),
                by.as_deref(),
                json,
            )
            .await?;
        }

        Commands::Resume { instance, data } => {
            cli::instance::handle_resume(&state, &instance, data.as_deref(), json).await?;
        }

        Commands::Poll { instance } => {
            cli::instance::handle_poll(&state, &instance, json).await?;
        }

        Commands::Pause { instance } => {
            cli::instance::handle_pause(&state, &instance, json).await?;
        }

        Commands::Cancel { instance, reason } => {
            cli::instance::handle_cancel(&state, &instance, reason.as_deref(), json).await?;
        }

        Commands::Goto { instance, step } => {
            cli::instance::handle_goto(&state, &instance, &step, json).await?;
        }

        Commands::Status { instance } => {
            cli::instance::handle_status(&state, &instance, json).await?;
        }

        Commands::Logs { instance } => {
            cli::instance::handle_logs(&state, &instance, json).await?;
        }

        Commands::Task { action } => {
            cli::task::handle_task_command(action, &state, json).await?;
        }

        Commands::Config => {
            if json {
                cli::output::print_json(&serde_json::json!({
                    "data_dir": state.data_dir,
                    "config": state.config,
                }))?;
            } else {
                println!();
                println!("  Data dir: {}", style(state.data_dir.display()).cyan());
                println!();
                print!("{}", toml::to_string_pretty(&state.config)?);
                println!();
            }
        }
    }

    warn_dead_letters(&state);
    Ok(())
}

/// The dead-letter queue lives in memory, so anything still queued is lost
/// when the process exits.
fn warn_dead_letters(state: &AppState) {
    let queue = state.engine.dead_letters();
    if queue.is_empty() {
        return;
    }
    eprintln!(
        "{} {} operation(s) failed after retries and were dropped:",
        style("warning:").yellow().bold(),
        queue.len()
    );
    for item in queue.get_all() {
        tracing::warn!(
            id = %item.id,
            operation = item.operation_type.as_str(),
            attempts = item.attempts,
            "dead letter dropped at exit"
        );
        eprintln!("  - {} ({}): {}", item.operation_type, item.id, item.last_error);
    }
}
