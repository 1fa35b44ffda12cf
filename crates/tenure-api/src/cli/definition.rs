//! Workflow definition commands: validate, import, list, activate,
//! deactivate and set-default.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use tenure_core::service::definition::{DefinitionServiceError, ImportOptions};
use tenure_core::workflow::validator::validate_source;
use tenure_types::workflow::{ProcessType, WorkflowDefinition};

use super::output::{print_json, print_validation};
use crate::state::AppState;

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read '{}'", file.display()))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Validate a definition file. Needs no database.
pub async fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let source = read_source(file).await?;
    let result = validate_source(&source);

    if json {
        print_json(&result)?;
    } else {
        println!();
        if result.valid {
            println!(
                "  {} '{}' is valid",
                style("*").green().bold(),
                style(file.display()).cyan()
            );
        } else {
            println!(
                "  {} '{}' has {} error(s)",
                style("x").red().bold(),
                style(file.display()).cyan(),
                result.errors.len()
            );
        }
        print_validation(&result);
        println!();
    }

    if !result.valid {
        bail!("validation failed with {} error(s)", result.errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

pub async fn handle_import(
    state: &AppState,
    file: &Path,
    activate: bool,
    make_default: bool,
    json: bool,
) -> Result<()> {
    let source = read_source(file).await?;
    let options = ImportOptions {
        activate,
        make_default,
    };

    let outcome = match state.definitions.import_source(&source, options).await {
        Ok(outcome) => outcome,
        Err(DefinitionServiceError::Invalid(result)) => {
            if json {
                print_json(&result)?;
            } else {
                println!();
                print_validation(&result);
                println!();
            }
            bail!("'{}' is not a valid workflow definition", file.display());
        }
        Err(e) => return Err(e.into()),
    };

    let def = &outcome.definition;
    if json {
        return print_json(&json!({
            "id": def.id,
            "code": def.code,
            "version": def.version,
            "created": outcome.created,
            "is_active": def.is_active,
            "is_default": def.is_default,
            "validation": outcome.validation,
        }));
    }

    println!();
    println!(
        "  {} {} workflow '{}' (v{})",
        style("*").green().bold(),
        if outcome.created { "Imported" } else { "Updated" },
        style(&def.code).cyan(),
        def.version
    );
    println!("  ID:      {}", def.id);
    println!("  Type:    {}", def.process_type);
    println!("  Steps:   {}", def.steps.len());
    println!("  Active:  {}", yes_no(def.is_active));
    println!("  Default: {}", yes_no(def.is_default));
    if !outcome.validation.valid {
        println!(
            "  {}",
            style("Saved as an inactive draft; fix the errors below before activating.").yellow()
        );
    }
    print_validation(&outcome.validation);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, process_type: Option<ProcessType>, json: bool) -> Result<()> {
    let defs = state.definitions.list(process_type).await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "code": d.code,
                    "title": d.title,
                    "process_type": d.process_type,
                    "version": d.version,
                    "is_active": d.is_active,
                    "is_default": d.is_default,
                    "steps": d.steps.len(),
                    "stats": d.stats,
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflow definitions.");
        println!(
            "  Import one with: {}",
            style("tenure import <file.yaml> --activate").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Code").fg(Color::Cyan),
            Cell::new("Title"),
            Cell::new("Type"),
            Cell::new("Version"),
            Cell::new("Active"),
            Cell::new("Default"),
            Cell::new("Steps"),
            Cell::new("Runs"),
            Cell::new("Success"),
        ]);

    for d in &defs {
        let success = d
            .stats
            .success_rate
            .map(|r| format!("{r:.0}%"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&d.code),
            Cell::new(&d.title),
            Cell::new(d.process_type.as_str()),
            Cell::new(d.version),
            active_cell(d.is_active),
            Cell::new(if d.is_default { "*" } else { "" }),
            Cell::new(d.steps.len()),
            Cell::new(d.stats.usage_count),
            Cell::new(success),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Activate / deactivate / set-default
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Lifecycle {
    Activate,
    Deactivate,
    SetDefault,
}

pub async fn handle_lifecycle(state: &AppState, code: &str, op: Lifecycle, json: bool) -> Result<()> {
    let def = state.definitions.get_by_code(code).await?;
    let result = match op {
        Lifecycle::Activate => state.definitions.activate(&def.id).await,
        Lifecycle::Deactivate => state.definitions.deactivate(&def.id).await,
        Lifecycle::SetDefault => state.definitions.set_default_for_type(&def.id).await,
    };

    let updated = match result {
        Ok(updated) => updated,
        Err(DefinitionServiceError::Invalid(validation)) => {
            if !json {
                println!();
                print_validation(&validation);
                println!();
            }
            bail!("'{code}' cannot be activated until its validation errors are fixed");
        }
        Err(e) => return Err(e.into()),
    };

    print_definition_state(&updated, json)
}

fn print_definition_state(def: &WorkflowDefinition, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "code": def.code,
            "is_active": def.is_active,
            "is_default": def.is_default,
        }));
    }
    println!();
    println!(
        "  {} '{}' active: {}, default for {}: {}",
        style("*").green().bold(),
        style(&def.code).cyan(),
        yes_no(def.is_active),
        def.process_type,
        yes_no(def.is_default)
    );
    println!();
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn active_cell(active: bool) -> Cell {
    if active {
        Cell::new("active").fg(Color::Green)
    } else {
        Cell::new("draft").fg(Color::DarkGrey)
    }
}
