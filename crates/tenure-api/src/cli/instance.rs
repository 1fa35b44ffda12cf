//! Instance commands: start, complete, resume, poll, pause, cancel, goto,
//! status and logs.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use tenure_core::repository::instance::InstanceRepository;
use tenure_core::workflow::engine::{DefinitionSelector, StartOptions};
use tenure_types::workflow::ProcessType;

use super::output::{
    log_level_cell, print_execution_result, print_json, step_status_cell, styled_status,
};
use super::parse_json_arg;
use crate::state::AppState;

/// Arguments of `tenure start`, already parsed by clap.
pub struct StartArgs {
    pub code: Option<String>,
    pub process_type: Option<ProcessType>,
    pub process: String,
    pub data: Option<String>,
    pub vars: Vec<(String, Value)>,
    pub by: Option<String>,
}

/// Build engine start options from CLI arguments.
pub fn start_options(args: StartArgs) -> Result<StartOptions> {
    let selector = match (args.code, args.process_type) {
        (Some(code), _) => DefinitionSelector::Code(code),
        (None, Some(process_type)) => DefinitionSelector::DefaultFor(process_type),
        (None, None) => bail!("either a definition code or --type is required"),
    };

    let mut options = StartOptions::new(selector, &args.process);
    if let Some(data) = parse_json_arg("data", args.data.as_deref())? {
        if !data.is_object() {
            bail!("--data must be a JSON object");
        }
        options.process_data = data;
    }
    options.variables = args.vars.into_iter().collect::<Map<String, Value>>();
    options.started_by = args.by;
    Ok(options)
}

pub async fn handle_start(state: &AppState, args: StartArgs, json: bool) -> Result<()> {
    let options = start_options(args)?;
    let process_id = options.process_id.clone();
    let result = state.engine.start_workflow(options).await?;
    print_execution_result(&format!("Started workflow for process '{process_id}'"), &result, json)
}

pub async fn handle_complete(
    state: &AppState,
    instance: &Uuid,
    step: &str,
    result: Option<&str>,
    by: Option<&str>,
    json: bool,
) -> Result<()> {
    let payload = parse_json_arg("result", result)?.unwrap_or_else(|| json!({}));
    let outcome = state
        .engine
        .complete_waiting_step(instance, step, payload, by)
        .await?;
    print_execution_result(&format!("Completed step '{step}'"), &outcome, json)
}

pub async fn handle_resume(state: &AppState, instance: &Uuid, data: Option<&str>, json: bool) -> Result<()> {
    let trigger = parse_json_arg("data", data)?;
    let result = state.engine.resume_workflow(instance, trigger).await?;
    print_execution_result("Resumed workflow", &result, json)
}

pub async fn handle_poll(state: &AppState, instance: &Uuid, json: bool) -> Result<()> {
    let result = state.engine.poll_waiting_steps(instance).await?;
    print_execution_result("Polled waiting step", &result, json)
}

pub async fn handle_pause(state: &AppState, instance: &Uuid, json: bool) -> Result<()> {
    let result = state.engine.pause_workflow(instance).await?;
    print_execution_result("Paused workflow", &result, json)
}

pub async fn handle_cancel(state: &AppState, instance: &Uuid, reason: Option<&str>, json: bool) -> Result<()> {
    let result = state.engine.cancel_workflow(instance, reason).await?;
    print_execution_result("Cancelled workflow", &result, json)
}

pub async fn handle_goto(state: &AppState, instance: &Uuid, step: &str, json: bool) -> Result<()> {
    let result = state.engine.execute_step(instance, step).await?;
    print_execution_result(&format!("Executed from step '{step}'"), &result, json)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, instance_id: &Uuid, json: bool) -> Result<()> {
    let snapshot = state.engine.get_instance_snapshot(instance_id).await?;

    if json {
        return print_json(&json!({
            "instance": snapshot.instance,
            "steps": snapshot.steps,
        }));
    }

    let instance = &snapshot.instance;
    println!();
    println!("  Instance:  {}", style(instance.id).cyan());
    println!("  Process:   {}", instance.process_id);
    println!(
        "  Workflow:  {} (v{})",
        instance.definition_id, instance.definition_version
    );
    println!("  Status:    {}", styled_status(instance.status));
    println!(
        "  Progress:  {}/{} steps ({}%)",
        instance.completed_steps, instance.total_steps, instance.progress_percentage
    );
    if let Some(step) = &instance.current_step_id {
        println!("  Current:   {step}");
    }
    if let Some(parent) = &instance.parent {
        println!("  Parent:    {}", parent.instance_id);
    }
    println!("  Started:   {}", instance.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(eta) = instance.estimated_completion_at {
        println!("  Estimated: {}", eta.format("%Y-%m-%d %H:%M"));
    }
    if let Some(done) = instance.completed_at {
        println!("  Finished:  {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &instance.error_message {
        println!("  Error:     {}", style(error).red());
    }

    if snapshot.steps.is_empty() {
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Items"),
            Cell::new("Error"),
        ]);

    for record in &snapshot.steps {
        table.add_row(vec![
            Cell::new(&record.step_id),
            Cell::new(record.step_type.as_str()),
            step_status_cell(record.status),
            Cell::new(record.retry_count),
            Cell::new(record.created_item_ids.len()),
            Cell::new(record.error_message.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub async fn handle_logs(state: &AppState, instance_id: &Uuid, json: bool) -> Result<()> {
    // Surfaces InstanceNotFound instead of an empty log for unknown IDs.
    state.engine.get_instance_snapshot(instance_id).await?;
    let logs = state.engine.instances().get_logs(instance_id).await?;

    if json {
        return print_json(&logs);
    }

    if logs.is_empty() {
        println!();
        println!("  No log entries.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Level"),
            Cell::new("Event"),
            Cell::new("Step"),
            Cell::new("Message"),
        ]);

    for entry in &logs {
        table.add_row(vec![
            Cell::new(entry.created_at.format("%H:%M:%S%.3f")),
            log_level_cell(entry.level),
            Cell::new(&entry.event),
            Cell::new(entry.step_id.as_deref().unwrap_or("")),
            Cell::new(&entry.message),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(code: Option<&str>, process_type: Option<ProcessType>) -> StartArgs {
        StartArgs {
            code: code.map(str::to_string),
            process_type,
            process: "P-42".to_string(),
            data: None,
            vars: Vec::new(),
            by: None,
        }
    }

    #[test]
    fn start_options_prefers_code() {
        let options = start_options(args(Some("joiner-std"), None)).unwrap();
        assert_eq!(options.selector, DefinitionSelector::Code("joiner-std".to_string()));
        assert_eq!(options.process_id, "P-42");

        let options = start_options(args(None, Some(ProcessType::Leaver))).unwrap();
        assert_eq!(options.selector, DefinitionSelector::DefaultFor(ProcessType::Leaver));

        assert!(start_options(args(None, None)).is_err());
    }

    #[test]
    fn start_options_carries_data_and_vars() {
        let mut a = args(Some("joiner-std"), None);
        a.data = Some(r#"{"department":"eng"}"#.to_string());
        a.vars = vec![("laptop".to_string(), json!("mac")), ("count".to_string(), json!(2))];
        a.by = Some("hr-admin".to_string());

        let options = start_options(a).unwrap();
        assert_eq!(options.process_data, json!({"department": "eng"}));
        assert_eq!(options.variables["laptop"], json!("mac"));
        assert_eq!(options.variables["count"], json!(2));
        assert_eq!(options.started_by.as_deref(), Some("hr-admin"));
    }

    #[test]
    fn start_options_rejects_non_object_data() {
        let mut a = args(Some("joiner-std"), None);
        a.data = Some("[1,2]".to_string());
        assert!(start_options(a).is_err());
    }
}
