//! Run journal: an incremental Markdown log written inside the run's
//! working directory, so it travels with the branch.
//!
//! Journal writes are best-effort. A run must never die because a log
//! line could not be written, so every failure lands in the log output
//! instead of the error path.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::context::PipelineContext;

fn build_filename(ctx: &PipelineContext) -> String {
    let date = ctx.started_at.format("%Y%m%d");
    let slug = crate::workspace::branch::slugify(&ctx.task.title);
    match &ctx.task.source_id {
        Some(source_id) => format!("{}-{}-{}.md", date, source_id.replace(':', "-"), slug),
        None => format!("{}-{}.md", date, slug),
    }
}

pub struct RunJournal {
    dir: PathBuf,
    path: PathBuf,
}

impl RunJournal {
    /// Journals live under `levelup/` in the run's working path.
    pub fn new(ctx: &PipelineContext) -> Self {
        let dir = ctx.effective_path().join("levelup");
        let path = dir.join(build_filename(ctx));
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Title, run metadata, and the task description.
    pub fn write_header(&self, ctx: &PipelineContext) {
        let mut lines = vec![
            format!("# Run Journal: {}", ctx.task.title),
            String::new(),
            format!("- **Run ID:** {}", ctx.run_id),
            format!(
                "- **Started:** {}",
                ctx.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ];
        if let Some(source_id) = &ctx.task.source_id {
            lines.push(format!("- **Ticket:** {} ({})", source_id, ctx.task.source));
        }
        if !ctx.task.description.is_empty() {
            lines.push(String::new());
            lines.push("## Task Description".to_string());
            lines.push(String::new());
            lines.push(ctx.task.description.clone());
        }
        lines.push(String::new());
        self.write_fresh(&lines);
    }

    /// A section for a completed pipeline step, with usage figures.
    pub fn log_step(&self, step_name: &str, ctx: &PipelineContext) {
        let now = Utc::now().format("%H:%M:%S");
        let mut lines = vec![format!("## Step: {}  ({})", step_name, now), String::new()];
        lines.extend(format_step(step_name, ctx));

        if let Some(usage) = ctx.step_usage.get(step_name) {
            let mut parts = Vec::new();
            if usage.cost_usd > 0.0 {
                parts.push(format!("${:.4}", usage.cost_usd));
            }
            let tokens = usage.input_tokens + usage.output_tokens;
            if tokens > 0 {
                parts.push(format!("{} tokens", tokens));
            }
            if usage.duration_ms > 0.0 {
                parts.push(format!("{:.1}s", usage.duration_ms / 1000.0));
            }
            if !parts.is_empty() {
                lines.push(format!("- **Usage:** {}", parts.join(" | ")));
            }
        }
        lines.push(String::new());
        self.append(&lines);
    }

    pub fn log_checkpoint(&self, step_name: &str, decision: &str, feedback: &str) {
        let mut lines = vec![
            format!("### Checkpoint: {}", step_name),
            String::new(),
            format!("- **Decision:** {}", decision),
        ];
        if !feedback.is_empty() {
            lines.push(format!("- **Feedback:** {}", feedback));
        }
        lines.push(String::new());
        self.append(&lines);
    }

    pub fn log_resume(&self, from_step: &str) {
        self.append(&[format!("\n## Resumed from step: {}", from_step), String::new()]);
    }

    /// Final status, error, and total cost.
    pub fn log_outcome(&self, ctx: &PipelineContext) {
        let mut lines = vec![
            "## Outcome".to_string(),
            String::new(),
            format!("- **Status:** {}", ctx.status),
        ];
        if let Some(error) = &ctx.error_message {
            lines.push(format!("- **Error:** {}", error));
        }
        if ctx.total_cost_usd > 0.0 {
            lines.push(format!("- **Total cost:** ${:.4}", ctx.total_cost_usd));
        }
        lines.push(String::new());
        self.append(&lines);
    }

    fn write_fresh(&self, lines: &[String]) {
        if let Err(e) = std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&self.path, lines.join("\n")))
        {
            warn!(path = %self.path.display(), error = %e, "failed to write journal header");
        }
    }

    fn append(&self, lines: &[String]) {
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?
                .write_all(lines.join("\n").as_bytes())
        });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to append to journal");
        }
    }
}

fn format_step(step_name: &str, ctx: &PipelineContext) -> Vec<String> {
    match step_name {
        "detect" => {
            let mut facts = Vec::new();
            if let Some(l) = &ctx.language {
                facts.push(format!("language {}", l));
            }
            if let Some(t) = &ctx.test_command {
                facts.push(format!("test command `{}`", t));
            }
            if facts.is_empty() {
                vec!["Nothing detected; agents will explore the project themselves.".to_string()]
            } else {
                vec![format!("Detected: {}.", facts.join(", "))]
            }
        }
        "requirements" => match &ctx.requirements {
            None => vec!["No requirements produced.".to_string()],
            Some(r) => vec![
                format!("**Summary:** {}", r.summary),
                format!("- {} requirement(s)", r.requirements.len()),
                format!("- {} assumption(s)", r.assumptions.len()),
                format!("- {} out-of-scope item(s)", r.out_of_scope.len()),
            ],
        },
        "planning" => match &ctx.plan {
            None => vec!["No plan produced.".to_string()],
            Some(p) => {
                let mut lines = vec![
                    format!("**Approach:** {}", p.approach),
                    format!("- {} implementation step(s)", p.steps.len()),
                ];
                if !p.affected_files.is_empty() {
                    lines.push(format!("- **Affected files:** {}", p.affected_files.join(", ")));
                }
                lines
            }
        },
        "test_writing" => {
            if ctx.test_files.is_empty() {
                vec!["No test files written.".to_string()]
            } else {
                let mut lines = vec![format!("Wrote {} test file(s):", ctx.test_files.len())];
                for f in &ctx.test_files {
                    let status = if f.is_new { "new" } else { "modified" };
                    lines.push(format!("- `{}` ({})", f.path, status));
                }
                lines
            }
        }
        "coding" => {
            let mut lines = Vec::new();
            if !ctx.code_files.is_empty() {
                lines.push(format!("Wrote {} file(s):", ctx.code_files.len()));
                for f in &ctx.code_files {
                    let status = if f.is_new { "new" } else { "modified" };
                    lines.push(format!("- `{}` ({})", f.path, status));
                }
            }
            if let Some(latest) = ctx.test_results.last() {
                let status = if latest.passed { "PASSED" } else { "FAILED" };
                lines.push(format!(
                    "- **Test results:** {} total, {} failures, {} errors ({})",
                    latest.total, latest.failures, latest.errors, status
                ));
            }
            if lines.is_empty() {
                lines.push("Coding step completed.".to_string());
            }
            lines
        }
        "security" => {
            if ctx.security_findings.is_empty() {
                vec!["No security findings.".to_string()]
            } else {
                let mut lines = vec![format!(
                    "Found {} security issue(s), {} patched:",
                    ctx.security_findings.len(),
                    ctx.security_patches_applied
                )];
                for f in &ctx.security_findings {
                    lines.push(format!(
                        "- [{}] `{}`: {}",
                        f.severity.as_str().to_uppercase(),
                        f.file,
                        f.vulnerability_type
                    ));
                }
                lines
            }
        }
        "review" => {
            if ctx.review_findings.is_empty() {
                vec!["No review findings.".to_string()]
            } else {
                let mut lines = vec![format!("Found {} issue(s):", ctx.review_findings.len())];
                for f in &ctx.review_findings {
                    lines.push(format!(
                        "- [{}] `{}`: {}",
                        f.severity.as_str().to_uppercase(),
                        f.file,
                        f.message
                    ));
                }
                lines
            }
        }
        other => vec![format!("Step `{}` completed.", other)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FileChange, StepUsage, TaskInput};
    use tempfile::tempdir;

    fn ctx_in(dir: &Path) -> PipelineContext {
        PipelineContext::new(
            TaskInput::manual("Add Login Form", "Build the page"),
            dir.to_path_buf(),
        )
    }

    #[test]
    fn filename_includes_date_slug_and_ticket() {
        let dir = tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        ctx.task.source_id = Some("ticket:7".into());
        let journal = RunJournal::new(&ctx);
        let name = journal.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("-ticket-7-add-login-form.md"), "{}", name);
    }

    #[test]
    fn header_steps_and_outcome_accumulate() {
        let dir = tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        let journal = RunJournal::new(&ctx);

        journal.write_header(&ctx);
        ctx.test_files.push(FileChange {
            path: "tests/test_login.py".into(),
            content: String::new(),
            is_new: true,
        });
        ctx.record_usage(
            "test_writing",
            StepUsage {
                cost_usd: 0.12,
                input_tokens: 10,
                output_tokens: 5,
                duration_ms: 1500.0,
                num_turns: 1,
            },
        );
        journal.log_step("test_writing", &ctx);
        journal.log_checkpoint("test_writing", "revise", "cover the failure path");
        ctx.status = crate::context::PipelineStatus::Completed;
        journal.log_outcome(&ctx);

        let content = std::fs::read_to_string(journal.path()).unwrap();
        assert!(content.starts_with("# Run Journal: Add Login Form"));
        assert!(content.contains("## Task Description"));
        assert!(content.contains("## Step: test_writing"));
        assert!(content.contains("`tests/test_login.py` (new)"));
        assert!(content.contains("- **Usage:** $0.1200 | 15 tokens | 1.5s"));
        assert!(content.contains("- **Decision:** revise"));
        assert!(content.contains("- **Feedback:** cover the failure path"));
        assert!(content.contains("- **Status:** completed"));
    }

    #[test]
    fn journal_lands_in_worktree_when_present() {
        let dir = tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        let wt = dir.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        ctx.worktree_path = Some(wt.clone());
        let journal = RunJournal::new(&ctx);
        assert!(journal.path().starts_with(wt.join("levelup")));
    }

    #[test]
    fn write_failures_do_not_panic() {
        let dir = tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        // Point the journal at a directory that cannot be created (a file
        // is in the way).
        std::fs::write(dir.path().join("levelup"), "occupied").unwrap();
        ctx.worktree_path = None;
        let journal = RunJournal::new(&ctx);
        journal.write_header(&ctx);
        journal.log_outcome(&ctx);
    }
}
