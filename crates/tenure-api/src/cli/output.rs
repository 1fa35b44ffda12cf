//! Shared rendering helpers for CLI output.

use anyhow::Result;
use comfy_table::{Cell, Color};
use console::style;
use serde::Serialize;
use tenure_core::workflow::engine::ExecutionResult;
use tenure_types::instance::{InstanceStatus, LogLevel, StepStatus};
use tenure_types::validation::ValidationResult;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &impl ToString) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::Grey,
        StepStatus::InProgress => Color::Yellow,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn log_level_cell(level: LogLevel) -> Cell {
    let color = match level {
        LogLevel::Debug => Color::DarkGrey,
        LogLevel::Info => Color::Reset,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
    };
    Cell::new(level.as_str()).fg(color)
}

pub fn styled_status(status: InstanceStatus) -> String {
    let text = status.as_str();
    match status {
        InstanceStatus::Completed => style(text).green().to_string(),
        InstanceStatus::Failed | InstanceStatus::Cancelled => style(text).red().to_string(),
        s if s.is_waiting() || s == InstanceStatus::Paused => style(text).yellow().to_string(),
        _ => style(text).blue().to_string(),
    }
}

/// Print the outcome of an engine operation.
pub fn print_execution_result(headline: &str, result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }

    println!();
    println!("  {} {}", style("*").green().bold(), headline);
    println!("  Instance: {}", style(result.instance_id).cyan());
    println!("  Status:   {}", styled_status(result.status));
    println!(
        "  Progress: {}/{} steps ({}%)",
        result.completed_steps, result.total_steps, result.progress_percentage
    );
    if let Some(step) = &result.waiting_on {
        println!("  Waiting:  {}", style(step).yellow());
    } else if let Some(step) = &result.current_step_id {
        println!("  Step:     {step}");
    }
    if let Some(error) = &result.error {
        println!("  Error:    {}", style(error).red());
    }
    println!();
    Ok(())
}

/// Print validation errors, then warnings.
pub fn print_validation(result: &ValidationResult) {
    for error in &result.errors {
        println!("  {} {}", style("error").red().bold(), error);
    }
    for warning in &result.warnings {
        println!("  {} {}", style("warning").yellow().bold(), warning);
    }
}
