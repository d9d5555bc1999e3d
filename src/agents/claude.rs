//! Claude Code subprocess backend.
//!
//! Each agent invocation spawns the `claude` CLI in the run's working
//! directory, feeds the step instruction over stdin, and reads a JSON
//! result envelope from stdout for usage accounting. Interpreting what the
//! agent wrote to disk is left to later steps; the pipeline commits the
//! working tree after each step regardless.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::Agent;
use crate::context::{PipelineContext, StepUsage};
use crate::errors::AgentError;

/// Step instructions for the default roster. Deliberately compact: the
/// repository itself is the agent's primary context.
pub const DEFAULT_INSTRUCTIONS: [(&str, &str); 6] = [
    (
        "requirements",
        "Analyze the task below and write a structured requirements summary \
         (requirements, assumptions, out-of-scope items) to levelup/requirements.md.",
    ),
    (
        "planning",
        "Explore this codebase and write an implementation plan for the task below \
         to levelup/plan.md: approach, ordered steps, affected files, risks.",
    ),
    (
        "test_writer",
        "Write failing tests for the task below using this project's test framework. \
         Do not implement the feature yet.",
    ),
    (
        "coder",
        "Implement the task below until the project's tests pass. \
         Modify only what the task requires.",
    ),
    (
        "security",
        "Review the changes made for the task below for security vulnerabilities. \
         Patch what is safely patchable and report anything needing a human.",
    ),
    (
        "reviewer",
        "Review the changes made for the task below for correctness, quality, \
         and adherence to this project's conventions.",
    ),
];

pub struct ClaudeAgent {
    name: String,
    instruction: String,
    executable: String,
    model: Option<String>,
}

impl ClaudeAgent {
    pub fn new(
        name: impl Into<String>,
        instruction: impl Into<String>,
        executable: impl Into<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            executable: executable.into(),
            model,
        }
    }

    fn build_prompt(&self, ctx: &PipelineContext) -> String {
        let mut prompt = format!("{}\n\n## TASK\n{}\n", self.instruction, ctx.task.title);
        if !ctx.task.description.is_empty() {
            prompt.push_str(&format!("\n{}\n", ctx.task.description));
        }
        if let Some(language) = &ctx.language {
            prompt.push_str(&format!("\nProject language: {}", language));
        }
        if let Some(framework) = &ctx.framework {
            prompt.push_str(&format!("\nFramework: {}", framework));
        }
        if let Some(test_command) = &ctx.test_command {
            prompt.push_str(&format!("\nTest command: {}", test_command));
        }
        prompt
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepUsage, AgentError> {
        let exe = resolve_executable(&self.executable)
            .ok_or_else(|| AgentError::ExecutableNotFound(self.executable.clone()))?;

        let prompt = self.build_prompt(ctx);
        let start = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--dangerously-skip-permissions");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }

        let mut child = cmd
            .current_dir(ctx.effective_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Failed(format!("failed to spawn '{}': {}", self.executable, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Failed(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentError::Failed(format!("failed to close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::Failed(format!("agent process failed: {}", e)))?;

        let duration_ms = start.elapsed().as_millis() as f64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no error output").trim();
            return Err(AgentError::Failed(format!(
                "agent '{}' exited with {} ({})",
                self.name, output.status, detail
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_usage(&stdout, duration_ms))
    }
}

/// Usage figures from the CLI's JSON result envelope; zeros when the
/// output is not the expected shape.
fn parse_usage(stdout: &str, duration_ms: f64) -> StepUsage {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout.trim()) else {
        debug!("agent output was not a JSON envelope; recording duration only");
        return StepUsage {
            duration_ms,
            ..Default::default()
        };
    };
    StepUsage {
        cost_usd: value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        input_tokens: value
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: value
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        duration_ms: value
            .get("duration_ms")
            .and_then(|v| v.as_f64())
            .unwrap_or(duration_ms),
        num_turns: value
            .get("num_turns")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    }
}

/// Look up an executable on PATH; explicit paths are used as-is.
fn resolve_executable(exe: &str) -> Option<PathBuf> {
    let candidate = Path::new(exe);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskInput;

    fn sample_ctx() -> PipelineContext {
        let mut ctx =
            PipelineContext::new(TaskInput::manual("Add search", "Search by title"), "/tmp/p".into());
        ctx.language = Some("python".into());
        ctx.test_command = Some("pytest".into());
        ctx
    }

    #[test]
    fn prompt_includes_instruction_task_and_detection() {
        let agent = ClaudeAgent::new("coder", "Implement the task.", "claude", None);
        let prompt = agent.build_prompt(&sample_ctx());
        assert!(prompt.starts_with("Implement the task."));
        assert!(prompt.contains("## TASK\nAdd search"));
        assert!(prompt.contains("Search by title"));
        assert!(prompt.contains("Project language: python"));
        assert!(prompt.contains("Test command: pytest"));
    }

    #[test]
    fn parse_usage_reads_result_envelope() {
        let stdout = r#"{
            "total_cost_usd": 0.42,
            "duration_ms": 12345.0,
            "num_turns": 7,
            "usage": {"input_tokens": 1000, "output_tokens": 250}
        }"#;
        let usage = parse_usage(stdout, 99.0);
        assert!((usage.cost_usd - 0.42).abs() < f64::EPSILON);
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.output_tokens, 250);
        assert!((usage.duration_ms - 12345.0).abs() < f64::EPSILON);
        assert_eq!(usage.num_turns, 7);
    }

    #[test]
    fn parse_usage_tolerates_non_json_output() {
        let usage = parse_usage("plain text result", 250.0);
        assert_eq!(usage.input_tokens, 0);
        assert!((usage.duration_ms - 250.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_executable_is_unrecoverable() {
        let agent = ClaudeAgent::new(
            "coder",
            "x",
            "levelup-test-no-such-binary-on-path",
            None,
        );
        let mut ctx = sample_ctx();
        let err = agent.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::ExecutableNotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn resolve_executable_accepts_explicit_paths_only_if_present() {
        assert!(resolve_executable("/definitely/not/here/claude").is_none());
        assert!(resolve_executable("levelup-test-no-such-binary-on-path").is_none());
    }
}
