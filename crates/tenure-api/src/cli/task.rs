//! Task and approval commands.
//!
//! Closing an item here updates the host-side record; the engine learns
//! about it by polling the instance's waiting step right afterwards.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use tenure_core::workflow::collaborators::WorkItemKind;
use tenure_types::instance::WorkItemStatus;

use super::output::{print_execution_result, print_json, short_id};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// List open tasks and approvals, or every item of one instance.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        instance: Option<Uuid>,
    },

    /// Complete a task or approve an approval.
    Done {
        /// Work item ID.
        item_id: String,
    },

    /// Reject an approval (or decline a task).
    Reject {
        /// Work item ID.
        item_id: String,
    },
}

pub async fn handle_task_command(action: TaskCommand, state: &AppState, json: bool) -> Result<()> {
    match action {
        TaskCommand::List { instance } => list_items(state, instance.as_ref(), json).await,
        TaskCommand::Done { item_id } => {
            close_item(state, &item_id, WorkItemStatus::Completed, json).await
        }
        TaskCommand::Reject { item_id } => {
            close_item(state, &item_id, WorkItemStatus::Rejected, json).await
        }
    }
}

async fn list_items(state: &AppState, instance: Option<&Uuid>, json: bool) -> Result<()> {
    let items = match instance {
        Some(id) => state.work_items.list_for_instance(id).await?,
        None => state.work_items.list_open().await?,
    };

    if json {
        return print_json(&items);
    }

    if items.is_empty() {
        println!();
        println!("  No work items.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Title"),
            Cell::new("Process"),
            Cell::new("Step"),
            Cell::new("Assignee"),
            Cell::new("Due"),
            Cell::new("Status"),
        ]);

    for item in &items {
        let due = item
            .due_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&item.id),
            Cell::new(kind_label(item.kind)),
            Cell::new(&item.title),
            Cell::new(&item.process_id),
            Cell::new(format!("{} ({})", item.step_id, short_id(&item.instance_id))),
            Cell::new(item.assignee.as_deref().unwrap_or("")),
            Cell::new(due),
            status_cell(item.status),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn close_item(state: &AppState, item_id: &str, status: WorkItemStatus, json: bool) -> Result<()> {
    let Some(existing) = state.work_items.get(item_id).await? else {
        bail!("work item '{item_id}' not found");
    };
    if existing.status.is_closed() {
        bail!(
            "work item '{item_id}' is already {}",
            existing.status.as_str()
        );
    }

    let item = state.work_items.set_status(item_id, status).await?;
    tracing::info!(item_id, status = status.as_str(), instance_id = %item.instance_id, "work item closed");

    let result = state.engine.poll_waiting_steps(&item.instance_id).await?;
    let headline = format!(
        "{} {} '{}'",
        match status {
            WorkItemStatus::Rejected => "Rejected",
            _ => "Completed",
        },
        kind_label(item.kind),
        style(&item.title).cyan()
    );
    print_execution_result(&headline, &result, json)
}

fn kind_label(kind: WorkItemKind) -> &'static str {
    match kind {
        WorkItemKind::Task => "task",
        WorkItemKind::Approval => "approval",
    }
}

fn status_cell(status: WorkItemStatus) -> Cell {
    let color = match status {
        WorkItemStatus::Open => Color::Yellow,
        WorkItemStatus::Completed => Color::Green,
        WorkItemStatus::Rejected => Color::Red,
        WorkItemStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn task_subcommands_parse() {
        let cli = Cli::try_parse_from(["tenure", "task", "done", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Task { action: TaskCommand::Done { ref item_id } } if item_id == "abc"
        ));

        let cli = Cli::try_parse_from(["tenure", "task", "ls"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Task { action: TaskCommand::List { instance: None } }
        ));
    }
}
