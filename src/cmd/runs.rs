//! Run inspection and maintenance — `runs`, `show`, `pause`, `sweep`,
//! `delete`, `cleanup`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use console::style;

use levelup::context::{PipelineContext, PipelineStatus};
use levelup::settings::Settings;
use levelup::store::StateStore;
use levelup::ui;
use levelup::workspace::WorkspaceManager;

fn open_store(project_dir: &Path, db_path: Option<&PathBuf>) -> Result<(Settings, StateStore)> {
    let settings = Settings::load(project_dir).context("Failed to load levelup settings")?;
    let store = StateStore::open(settings.db_path(db_path.map(PathBuf::as_path)))
        .context("Failed to open the state database")?;
    Ok((settings, store))
}

pub fn cmd_runs(
    project_dir: &Path,
    db_path: Option<&PathBuf>,
    status: Option<&str>,
    limit: usize,
) -> Result<()> {
    let (_, store) = open_store(project_dir, db_path)?;
    let status = status
        .map(PipelineStatus::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let records = store.list_runs(status, limit)?;
    if records.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    for record in &records {
        ui::print_run_record(record);
    }
    Ok(())
}

pub fn cmd_show(project_dir: &Path, db_path: Option<&PathBuf>, run_id: &str) -> Result<()> {
    let (_, store) = open_store(project_dir, db_path)?;
    let Some(record) = store.get_run(run_id)? else {
        bail!("Run {} not found", run_id);
    };

    println!("{}", style(&record.task_title).bold());
    println!("  Run ID:   {}", record.run_id);
    println!("  Status:   {}", record.status);
    println!("  Project:  {}", record.project_path);
    if let Some(ticket) = record.ticket_number {
        println!("  Ticket:   #{}", ticket);
    }
    if let Some(step) = &record.current_step {
        println!("  Step:     {}", step);
    }
    if let Some(error) = &record.error_message {
        println!("  Error:    {}", style(error).red());
    }
    if record.total_cost_usd > 0.0 {
        println!(
            "  Usage:    ${:.4}  {} in / {} out tokens",
            record.total_cost_usd, record.input_tokens, record.output_tokens
        );
    }
    println!("  Started:  {}", record.started_at);
    println!("  Updated:  {}", record.updated_at);

    if let Some(snapshot) = record.context_json.as_deref()
        && let Ok(ctx) = serde_json::from_str::<PipelineContext>(snapshot)
    {
        if let Some(wt) = &ctx.worktree_path {
            println!("  Workspace: {}", wt.display());
        }
        if !ctx.step_commits.is_empty() {
            println!("  Commits:");
            for (step, sha) in &ctx.step_commits {
                println!("    {:20} {}", step, &sha[..sha.len().min(12)]);
            }
        }
    }
    Ok(())
}

pub fn cmd_pause(project_dir: &Path, db_path: Option<&PathBuf>, run_id: &str) -> Result<()> {
    let (_, store) = open_store(project_dir, db_path)?;
    store.request_pause(run_id)?;
    println!("Pause requested; the run will stop at its next step boundary.");
    Ok(())
}

pub fn cmd_sweep(project_dir: &Path, db_path: Option<&PathBuf>) -> Result<()> {
    let (_, store) = open_store(project_dir, db_path)?;
    let swept = store.mark_dead_runs()?;
    match swept {
        0 => println!("All active runs have live owner processes."),
        n => println!("Marked {} crashed run(s) as failed.", n),
    }
    Ok(())
}

pub fn cmd_delete(project_dir: &Path, db_path: Option<&PathBuf>, run_id: &str) -> Result<()> {
    let (_, store) = open_store(project_dir, db_path)?;
    if store.delete_run(run_id)? {
        println!("Deleted run {}.", run_id);
    } else {
        bail!("Run {} not found", run_id);
    }
    Ok(())
}

/// Remove a run's workspace checkout; the branch and its commits remain.
pub fn cmd_cleanup(project_dir: &Path, db_path: Option<&PathBuf>, run_id: &str) -> Result<()> {
    let (settings, store) = open_store(project_dir, db_path)?;
    let Some(record) = store.get_run(run_id)? else {
        bail!("Run {} not found", run_id);
    };
    let Some(snapshot) = record.context_json.as_deref() else {
        println!("Run {} has no workspace to clean up.", run_id);
        return Ok(());
    };
    let mut ctx: PipelineContext =
        serde_json::from_str(snapshot).context("Failed to read the run's context snapshot")?;
    if ctx.worktree_path.is_none() {
        println!("Run {} has no workspace to clean up.", run_id);
        return Ok(());
    }

    let workspace = WorkspaceManager::new(settings.worktree_root());
    workspace.cleanup(&mut ctx)?;
    store.update_run(&ctx)?;
    println!("Workspace removed; the run's branch and commits remain.");
    Ok(())
}
