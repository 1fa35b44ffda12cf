//! CLI command definitions for the `tenure` binary.
//!
//! Uses clap derive macros for argument parsing. Definition management
//! (`validate`, `import`, `list`, ...) and instance operations (`start`,
//! `complete`, `resume`, ...) are top-level verbs; task handling lives
//! under `tenure task`.

pub mod definition;
pub mod instance;
pub mod output;
pub mod task;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use tenure_types::workflow::ProcessType;
use uuid::Uuid;

/// Orchestrate joiner, mover and leaver workflows.
#[derive(Parser)]
#[command(name = "tenure", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans to stdout via OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (database and config.toml).
    #[arg(long, global = true, env = "TENURE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a YAML or JSON workflow definition without saving it.
    Validate {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// Import a definition file, updating the definition with the same code if one exists.
    Import {
        /// Path to the definition file.
        file: PathBuf,

        /// Activate the definition (fails if it does not validate).
        #[arg(long)]
        activate: bool,

        /// Make it the default definition for its process type.
        #[arg(long = "default")]
        make_default: bool,
    },

    /// List workflow definitions.
    #[command(alias = "ls")]
    List {
        /// Only show one process type (joiner, mover, leaver).
        #[arg(long = "type")]
        process_type: Option<ProcessType>,
    },

    /// Activate a definition after validating it.
    Activate {
        /// Definition code.
        code: String,
    },

    /// Deactivate a definition (also clears its default flag).
    Deactivate {
        /// Definition code.
        code: String,
    },

    /// Make a definition the default for its process type.
    SetDefault {
        /// Definition code.
        code: String,
    },

    /// Start a workflow for a business process.
    Start {
        /// Definition code. Omit to use the default for `--type`.
        #[arg(required_unless_present = "process_type")]
        code: Option<String>,

        /// Use the default definition for this process type.
        #[arg(long = "type", conflicts_with = "code")]
        process_type: Option<ProcessType>,

        /// Owning process ID.
        #[arg(long)]
        process: String,

        /// Process fields as a JSON object (exposed as `process.*`).
        #[arg(long)]
        data: Option<String>,

        /// Initial variable, `name=value` (value parsed as JSON when possible).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// User starting the workflow.
        #[arg(long)]
        by: Option<String>,
    },

    /// Complete a waiting step and continue the workflow.
    Complete {
        instance: Uuid,
        step: String,

        /// Step result as JSON; a `variables` object is merged into the instance.
        #[arg(long)]
        result: Option<String>,

        /// User completing the step.
        #[arg(long)]
        by: Option<String>,
    },

    /// Resume a paused or waiting instance at its current step.
    Resume {
        instance: Uuid,

        /// Trigger data as a JSON object, merged into the variables.
        #[arg(long)]
        data: Option<String>,
    },

    /// Re-check the step a waiting instance is suspended on.
    Poll { instance: Uuid },

    /// Pause a running or waiting instance.
    Pause { instance: Uuid },

    /// Cancel an instance.
    Cancel {
        instance: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Run a specific step of an instance and continue from there.
    Goto { instance: Uuid, step: String },

    /// Show an instance with its step records.
    Status { instance: Uuid },

    /// Show the audit log of an instance.
    Logs { instance: Uuid },

    /// Work with tasks and approvals created by workflow steps.
    Task {
        #[command(subcommand)]
        action: task::TaskCommand,
    },

    /// Show the effective engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse `name=value`; the value is JSON when it parses as JSON, else a string.
pub fn parse_var(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("variable name missing in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

/// Parse an optional JSON argument.
pub fn parse_json_arg(flag: &str, raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    raw.map(|s| {
        serde_json::from_str(s).map_err(|e| anyhow::anyhow!("--{flag} is not valid JSON: {e}"))
    })
    .transpose()
}
