use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use levelup::context::PipelineStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "levelup")]
#[command(version, about = "Human-checkpointed TDD pipeline for AI coding agents")]
pub struct Cli {
    /// Target repository (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// State database path (overrides LEVELUP_DB_PATH and levelup.yaml)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline for a task
    Run {
        /// Task title
        title: String,

        /// Task description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Ticket number this run works on
        #[arg(long)]
        ticket: Option<i64>,

        /// Resolve checkpoints through the store instead of the terminal
        #[arg(long)]
        headless: bool,

        /// Work directly in the repository without branch/worktree isolation
        #[arg(long)]
        no_branch: bool,
    },
    /// Resume a paused or failed run from its recorded step
    Resume {
        run_id: String,

        /// Step to resume from (defaults to the run's recorded step)
        #[arg(long)]
        from_step: Option<String>,

        /// Resolve checkpoints through the store instead of the terminal
        #[arg(long)]
        headless: bool,
    },
    /// List runs
    Runs {
        /// Filter by status (pending, running, waiting_for_input, paused,
        /// completed, failed, aborted)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one run in detail
    Show { run_id: String },
    /// List pending checkpoint requests
    Checkpoints,
    /// Decide a pending checkpoint request (approve, revise, reject)
    Decide {
        request_id: i64,
        decision: String,

        /// Feedback text (required for revise)
        #[arg(long, default_value = "")]
        feedback: String,
    },
    /// Ask a running pipeline to pause at its next step boundary
    Pause { run_id: String },
    /// Mark runs whose owning process died as failed
    Sweep,
    /// Delete a run and its checkpoint requests
    Delete { run_id: String },
    /// Remove a run's workspace checkout (the branch is kept)
    Cleanup { run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            title,
            description,
            ticket,
            headless,
            no_branch,
        } => {
            let status = cmd::cmd_run(
                &project_dir,
                cli.db_path.as_ref(),
                title,
                description,
                *ticket,
                *headless,
                *no_branch,
            )
            .await?;
            exit_for(status);
        }
        Commands::Resume {
            run_id,
            from_step,
            headless,
        } => {
            let status = cmd::cmd_resume(
                &project_dir,
                cli.db_path.as_ref(),
                run_id,
                from_step.as_deref(),
                *headless,
            )
            .await?;
            exit_for(status);
        }
        Commands::Runs { status, limit } => {
            cmd::cmd_runs(&project_dir, cli.db_path.as_ref(), status.as_deref(), *limit)?;
        }
        Commands::Show { run_id } => {
            cmd::cmd_show(&project_dir, cli.db_path.as_ref(), run_id)?;
        }
        Commands::Checkpoints => {
            cmd::cmd_checkpoints(&project_dir, cli.db_path.as_ref())?;
        }
        Commands::Decide {
            request_id,
            decision,
            feedback,
        } => {
            cmd::cmd_decide(
                &project_dir,
                cli.db_path.as_ref(),
                *request_id,
                decision,
                feedback,
            )?;
        }
        Commands::Pause { run_id } => {
            cmd::cmd_pause(&project_dir, cli.db_path.as_ref(), run_id)?;
        }
        Commands::Sweep => {
            cmd::cmd_sweep(&project_dir, cli.db_path.as_ref())?;
        }
        Commands::Delete { run_id } => {
            cmd::cmd_delete(&project_dir, cli.db_path.as_ref(), run_id)?;
        }
        Commands::Cleanup { run_id } => {
            cmd::cmd_cleanup(&project_dir, cli.db_path.as_ref(), run_id)?;
        }
    }

    Ok(())
}

/// Failed and aborted runs exit non-zero; the reason is already printed
/// and durably recorded for remote observers.
fn exit_for(status: PipelineStatus) {
    match status {
        PipelineStatus::Failed | PipelineStatus::Aborted => std::process::exit(1),
        _ => {}
    }
}
