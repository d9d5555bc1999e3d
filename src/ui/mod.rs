//! Terminal output helpers: step headers, checkpoint payload rendering,
//! and the end-of-run summary.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::CheckpointPayload;
use crate::context::{FileChange, PipelineContext};
use crate::store::{CheckpointRequestRecord, RunRecord};

pub fn print_step_header(name: &str, description: &str) {
    println!();
    println!("{} {}", style("▶").cyan().bold(), style(name).bold());
    if !description.is_empty() {
        println!("  {}", style(description).dim());
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Spinner shown while an agent subprocess runs.
pub fn agent_spinner(agent_name: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {} agent...", agent_name));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_file_list(title: &str, files: &[FileChange]) {
    println!("  {}", style(title).bold());
    for f in files {
        let status = if f.is_new { "new" } else { "modified" };
        println!("    {} ({})", f.path, style(status).dim());
    }
}

/// Render a checkpoint payload for the interactive prompt.
pub fn print_checkpoint_payload(payload: &CheckpointPayload) {
    println!();
    match payload {
        CheckpointPayload::Requirements { requirements } => match requirements {
            None => println!("  {}", style("No requirements produced.").dim()),
            Some(r) => {
                println!("  {} {}", style("Summary:").bold(), r.summary);
                for req in &r.requirements {
                    println!("    {} {}", style("•").cyan(), req.description);
                    for criterion in &req.acceptance_criteria {
                        println!("      - {}", style(criterion).dim());
                    }
                }
                if !r.assumptions.is_empty() {
                    println!("  {}", style("Assumptions:").bold());
                    for a in &r.assumptions {
                        println!("    - {}", a);
                    }
                }
                if !r.out_of_scope.is_empty() {
                    println!("  {}", style("Out of scope:").bold());
                    for o in &r.out_of_scope {
                        println!("    - {}", o);
                    }
                }
            }
        },
        CheckpointPayload::TestWriting { test_files } => {
            if test_files.is_empty() {
                println!("  {}", style("No test files written.").dim());
            } else {
                print_file_list("Test files", test_files);
            }
        }
        CheckpointPayload::Security {
            security_findings,
            patches_applied,
            requires_rework,
        } => {
            if security_findings.is_empty() {
                println!("  {}", style("No security findings.").green());
            } else {
                println!(
                    "  {} ({} patched)",
                    style(format!("{} security finding(s)", security_findings.len())).bold(),
                    patches_applied
                );
                for f in security_findings {
                    println!(
                        "    [{}] {} — {}",
                        style(f.severity.as_str().to_uppercase()).red(),
                        f.file,
                        f.vulnerability_type
                    );
                }
                if *requires_rework {
                    println!("  {}", style("Coding rework was requested.").yellow());
                }
            }
        }
        CheckpointPayload::Review {
            code_files,
            test_results,
            review_findings,
        } => {
            if !code_files.is_empty() {
                print_file_list("Implementation files", code_files);
            }
            if let Some(latest) = test_results.last() {
                let verdict = if latest.passed {
                    style("PASSED").green()
                } else {
                    style("FAILED").red()
                };
                println!(
                    "  {} {} total, {} failures, {} errors ({})",
                    style("Tests:").bold(),
                    latest.total,
                    latest.failures,
                    latest.errors,
                    verdict
                );
            }
            if review_findings.is_empty() {
                println!("  {}", style("No review findings.").green());
            } else {
                println!("  {}", style("Review findings:").bold());
                for f in review_findings {
                    println!(
                        "    [{}] {}: {}",
                        style(f.severity.as_str().to_uppercase()).yellow(),
                        f.file,
                        f.message
                    );
                }
            }
        }
    }
    println!();
}

pub fn print_pipeline_summary(ctx: &PipelineContext) {
    println!();
    println!("{}", style("Pipeline summary").bold().underlined());
    println!("  Run ID:  {}", ctx.run_id);
    println!("  Status:  {}", ctx.status);
    if let Some(error) = &ctx.error_message {
        println!("  Error:   {}", style(error).red());
    }
    if !ctx.step_usage.is_empty() {
        println!("  Steps:");
        for (step, usage) in &ctx.step_usage {
            println!(
                "    {:14} ${:.4}  {} tokens  {:.1}s",
                step,
                usage.cost_usd,
                usage.input_tokens + usage.output_tokens,
                usage.duration_ms / 1000.0
            );
        }
    }
    if ctx.total_cost_usd > 0.0 {
        println!("  Total cost: ${:.4}", ctx.total_cost_usd);
    }
    if let Some(wt) = &ctx.worktree_path {
        println!("  Workspace:  {}", wt.display());
    }
}

pub fn print_run_record(record: &RunRecord) {
    let status = match record.status.as_str() {
        "completed" => style(record.status.as_str()).green(),
        "failed" | "aborted" => style(record.status.as_str()).red(),
        "waiting_for_input" => style(record.status.as_str()).yellow(),
        other => style(other).cyan(),
    };
    println!(
        "{}  {:18}  {:24}  {}",
        record.run_id,
        status,
        record.current_step.as_deref().unwrap_or("-"),
        record.task_title
    );
}

pub fn print_checkpoint_record(record: &CheckpointRequestRecord) {
    println!(
        "{:6}  {}  {:14}  created {}",
        record.id, record.run_id, record.step_name, record.created_at
    );
}
