//! Pipeline execution — `levelup run` and `levelup resume`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use levelup::agents::AgentSet;
use levelup::context::{PipelineStatus, TaskInput};
use levelup::detect::SettingsDetector;
use levelup::engine::Engine;
use levelup::settings::Settings;
use levelup::store::StateStore;

fn build_engine(
    project_dir: &Path,
    db_path: Option<&Path>,
    headless: bool,
    no_branch: bool,
) -> Result<Engine> {
    let mut settings =
        Settings::load(project_dir).context("Failed to load levelup settings")?;
    if settings.project.path.is_none() {
        settings.project.path = Some(project_dir.to_path_buf());
    }
    if no_branch {
        settings.pipeline.create_git_branch = false;
    }

    let store = StateStore::open(settings.db_path(db_path))
        .context("Failed to open the state database")?;
    let detector = Box::new(SettingsDetector::from_settings(&settings));
    let agents = AgentSet::claude_defaults(&settings);
    Ok(Engine::new(
        settings,
        Some(store),
        detector,
        agents,
        !headless,
    ))
}

/// Start a run. Returns the terminal status so the caller can set the
/// process exit code.
#[allow(clippy::too_many_arguments)]
pub async fn cmd_run(
    project_dir: &Path,
    db_path: Option<&PathBuf>,
    title: &str,
    description: &str,
    ticket: Option<i64>,
    headless: bool,
    no_branch: bool,
) -> Result<PipelineStatus> {
    let engine = build_engine(project_dir, db_path.map(PathBuf::as_path), headless, no_branch)?;
    let task = match ticket {
        Some(n) => TaskInput::from_ticket(title, description, n),
        None => TaskInput::manual(title, description),
    };

    let ctx = engine.run(task).await?;
    report_outcome(&ctx.status, ctx.error_message.as_deref());
    Ok(ctx.status)
}

/// Resume a persisted run at its recorded step (or an explicit one).
pub async fn cmd_resume(
    project_dir: &Path,
    db_path: Option<&PathBuf>,
    run_id: &str,
    from_step: Option<&str>,
    headless: bool,
) -> Result<PipelineStatus> {
    let engine = build_engine(project_dir, db_path.map(PathBuf::as_path), headless, false)?;
    let ctx = engine.resume(run_id, from_step).await?;
    report_outcome(&ctx.status, ctx.error_message.as_deref());
    Ok(ctx.status)
}

fn report_outcome(status: &PipelineStatus, error: Option<&str>) {
    match status {
        PipelineStatus::Completed => {
            levelup::ui::print_success("Pipeline completed.");
        }
        PipelineStatus::Paused => {
            println!("Run paused. Resume with: levelup resume <run_id>");
        }
        PipelineStatus::Aborted => {
            levelup::ui::print_error("Pipeline aborted at a checkpoint.");
        }
        PipelineStatus::Failed => {
            levelup::ui::print_error(error.unwrap_or("Pipeline failed."));
        }
        other => {
            println!("Run ended in state: {}", other);
        }
    }
}
