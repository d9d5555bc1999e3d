//! Checkpoints: the pause points where a human gates continuation.
//!
//! The display payload is a tagged union keyed by step name — one variant
//! per checkpoint-enabled step — serialized into the checkpoint request row
//! and rendered by whichever approver picks it up (terminal or GUI). It is
//! the sole contract between the engine and any remote approver.

use std::time::Duration;

use anyhow::{Context, anyhow};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::{
    CheckpointDecision, FileChange, PipelineContext, PipelineStatus, Requirements, ReviewFinding,
    SecurityFinding, TestResult,
};
use crate::errors::EngineError;
use crate::store::StateStore;
use crate::ui;

/// Step-specific checkpoint content, serializable for remote approvers and
/// renderable directly to a terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_name", rename_all = "snake_case")]
pub enum CheckpointPayload {
    Requirements {
        requirements: Option<Requirements>,
    },
    TestWriting {
        test_files: Vec<FileChange>,
    },
    Security {
        security_findings: Vec<SecurityFinding>,
        patches_applied: u32,
        requires_rework: bool,
    },
    Review {
        code_files: Vec<FileChange>,
        test_results: Vec<TestResult>,
        review_findings: Vec<ReviewFinding>,
    },
}

impl CheckpointPayload {
    /// Build the payload for a checkpoint-enabled step. `None` for steps
    /// that have no checkpoint.
    pub fn for_step(step_name: &str, ctx: &PipelineContext) -> Option<Self> {
        match step_name {
            "requirements" => Some(Self::Requirements {
                requirements: ctx.requirements.clone(),
            }),
            "test_writing" => Some(Self::TestWriting {
                test_files: ctx.test_files.clone(),
            }),
            "security" => Some(Self::Security {
                security_findings: ctx.security_findings.clone(),
                patches_applied: ctx.security_patches_applied,
                requires_rework: ctx.requires_coding_rework,
            }),
            "review" => Some(Self::Review {
                code_files: ctx.code_files.clone(),
                test_results: ctx.test_results.clone(),
                review_findings: ctx.review_findings.clone(),
            }),
            _ => None,
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            Self::Requirements { .. } => "requirements",
            Self::TestWriting { .. } => "test_writing",
            Self::Security { .. } => "security",
            Self::Review { .. } => "review",
        }
    }
}

/// Resolves checkpoint decisions, either from a local terminal prompt or by
/// round-tripping a request through the shared store for a remote approver.
pub struct CheckpointCoordinator {
    interactive: bool,
    poll_interval: Duration,
}

impl CheckpointCoordinator {
    pub fn new(interactive: bool, poll_interval: Duration) -> Self {
        Self {
            interactive,
            poll_interval,
        }
    }

    /// Block until a human decides the checkpoint for `step_name`.
    ///
    /// Non-interactive mode writes a pending request row, flips the run to
    /// `waiting_for_input`, and polls the store until an external actor
    /// marks the request decided — a cheap read plus a sleep per attempt,
    /// so the decision becomes visible within one polling interval.
    pub async fn request_decision(
        &self,
        store: Option<&StateStore>,
        ctx: &mut PipelineContext,
        step_name: &str,
    ) -> Result<(CheckpointDecision, String), EngineError> {
        let payload = CheckpointPayload::for_step(step_name, ctx)
            .ok_or_else(|| anyhow!("step '{}' is not checkpoint-enabled", step_name))?;

        if self.interactive {
            return prompt_terminal(&payload).map_err(EngineError::Other);
        }

        let store = store.ok_or(EngineError::StoreRequired)?;
        let payload_json =
            serde_json::to_string(&payload).context("Failed to serialize checkpoint payload")?;
        let request_id = store.create_checkpoint_request(&ctx.run_id, step_name, &payload_json)?;

        ctx.status = PipelineStatus::WaitingForInput;
        store.update_run(ctx)?;
        info!(run_id = %ctx.run_id, step = step_name, request_id, "waiting for checkpoint decision");

        loop {
            if let Some((decision, feedback)) = store.checkpoint_decision(request_id)? {
                ctx.status = PipelineStatus::Running;
                store.update_run(ctx)?;
                return Ok((decision, feedback));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Render the payload and block on a synchronous terminal prompt.
fn prompt_terminal(payload: &CheckpointPayload) -> anyhow::Result<(CheckpointDecision, String)> {
    ui::print_checkpoint_payload(payload);

    let options = &[
        "Approve — continue to the next step",
        "Revise — re-run this step with feedback",
        "Reject — abort the run",
    ];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Checkpoint '{}'", payload.step_name()))
        .items(options)
        .default(0)
        .interact()
        .context("Checkpoint prompt failed")?;

    match selection {
        0 => Ok((CheckpointDecision::Approve, String::new())),
        1 => {
            let feedback: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Revision feedback")
                .validate_with(|text: &String| {
                    if text.trim().is_empty() {
                        Err("feedback is required for revise")
                    } else {
                        Ok(())
                    }
                })
                .interact_text()
                .context("Feedback prompt failed")?;
            Ok((CheckpointDecision::Revise, feedback))
        }
        _ => Ok((CheckpointDecision::Reject, String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Requirement, Severity, TaskInput};
    use std::path::PathBuf;

    fn sample_ctx() -> PipelineContext {
        PipelineContext::new(TaskInput::manual("Add search", ""), PathBuf::from("/tmp/p"))
    }

    #[test]
    fn payload_is_tagged_by_step_name() {
        let mut ctx = sample_ctx();
        ctx.requirements = Some(Requirements {
            summary: "Two requirements".into(),
            requirements: vec![Requirement {
                id: "r1".into(),
                description: "search by title".into(),
                acceptance_criteria: vec![],
            }],
            ..Default::default()
        });

        let payload = CheckpointPayload::for_step("requirements", &ctx).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["step_name"], "requirements");
        assert_eq!(json["requirements"]["summary"], "Two requirements");

        let back: CheckpointPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.step_name(), "requirements");
    }

    #[test]
    fn for_step_covers_exactly_the_checkpoint_steps() {
        let ctx = sample_ctx();
        for step in ["requirements", "test_writing", "security", "review"] {
            assert!(CheckpointPayload::for_step(step, &ctx).is_some(), "{}", step);
        }
        for step in ["detect", "planning", "coding", "bogus"] {
            assert!(CheckpointPayload::for_step(step, &ctx).is_none(), "{}", step);
        }
    }

    #[test]
    fn review_payload_carries_findings_and_results() {
        let mut ctx = sample_ctx();
        ctx.code_files.push(FileChange {
            path: "src/search.py".into(),
            content: "def search(): ...".into(),
            is_new: true,
        });
        ctx.test_results.push(TestResult {
            passed: true,
            total: 5,
            ..Default::default()
        });
        ctx.review_findings.push(ReviewFinding {
            severity: Severity::Warning,
            category: "style".into(),
            file: "src/search.py".into(),
            line: Some(1),
            message: "missing docstring".into(),
            suggestion: String::new(),
        });

        let payload = CheckpointPayload::for_step("review", &ctx).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let back: CheckpointPayload = serde_json::from_str(&json).unwrap();
        match back {
            CheckpointPayload::Review {
                code_files,
                test_results,
                review_findings,
            } => {
                assert_eq!(code_files.len(), 1);
                assert_eq!(test_results[0].total, 5);
                assert_eq!(review_findings[0].message, "missing docstring");
            }
            other => panic!("wrong variant: {}", other.step_name()),
        }
    }
}
