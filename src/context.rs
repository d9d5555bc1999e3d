//! `PipelineContext` and the data models that flow through a run.
//!
//! The context is owned exclusively by one run. It is serialized as a JSON
//! snapshot into the run record after every step, which is what makes runs
//! observable from other processes and resumable after a crash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    WaitingForInput,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Active states count against the one-active-run-per-ticket guard.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::WaitingForInput)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_for_input" => Ok(Self::WaitingForInput),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid pipeline status: {}", s)),
        }
    }
}

/// A human's verdict at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Approve,
    Revise,
    Reject,
}

impl CheckpointDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Revise => "revise",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "revise" => Ok(Self::Revise),
            "reject" => Ok(Self::Reject),
            _ => Err(format!(
                "Invalid checkpoint decision '{}'. Valid values: approve, revise, reject",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Raw task input from the operator or a ticket file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_task_source")]
    pub source: String,
    #[serde(default)]
    pub source_id: Option<String>,
}

fn default_task_source() -> String {
    "manual".to_string()
}

impl TaskInput {
    pub fn manual(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            source: "manual".to_string(),
            source_id: None,
        }
    }

    pub fn from_ticket(
        title: impl Into<String>,
        description: impl Into<String>,
        ticket: i64,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            source: "ticket".to_string(),
            source_id: Some(format!("ticket:{}", ticket)),
        }
    }
}

/// A single requirement extracted by the requirements agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Structured output from the requirements agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub clarifications: Vec<String>,
}

/// A single step in the implementation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub order: u32,
    pub description: String,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
}

/// Structured output from the planning agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// A file created or modified by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_new: bool,
}

/// Result from one test-suite run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub command: String,
}

/// A single finding from the review agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub severity: Severity,
    pub category: String,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
}

/// A vulnerability detected by the security agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub severity: Severity,
    pub category: String,
    pub vulnerability_type: String,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub patch_applied: bool,
    #[serde(default)]
    pub patch_description: String,
    #[serde(default)]
    pub requires_manual_fix: bool,
    #[serde(default)]
    pub recommendation: String,
}

/// Usage metrics from a single pipeline step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepUsage {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub num_turns: u32,
}

/// The single mutable value threaded through every step of one run.
///
/// Never shared between concurrent runs. Round-trips through JSON as the
/// run record's snapshot, so every field must tolerate absence on the way
/// back in (`serde(default)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub task: TaskInput,

    // Project info, seeded by the detection step.
    pub project_path: PathBuf,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub test_runner: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub branch_naming: Option<String>,

    // Agent outputs, populated sequentially.
    #[serde(default)]
    pub requirements: Option<Requirements>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub test_files: Vec<FileChange>,
    #[serde(default)]
    pub code_files: Vec<FileChange>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub review_findings: Vec<ReviewFinding>,

    // Security outputs.
    #[serde(default)]
    pub security_findings: Vec<SecurityFinding>,
    #[serde(default)]
    pub security_patches_applied: u32,
    #[serde(default)]
    pub requires_coding_rework: bool,
    #[serde(default)]
    pub security_feedback: String,

    // Pipeline state.
    pub status: PipelineStatus,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,

    // Usage tracking.
    #[serde(default)]
    pub step_usage: BTreeMap<String, StepUsage>,
    #[serde(default)]
    pub total_cost_usd: f64,

    // Git tracking.
    #[serde(default)]
    pub pre_run_sha: Option<String>,
    #[serde(default)]
    pub step_commits: BTreeMap<String, String>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
}

impl PipelineContext {
    pub fn new(task: TaskInput, project_path: PathBuf) -> Self {
        Self {
            run_id: new_run_id(),
            started_at: Utc::now(),
            task,
            project_path,
            language: None,
            framework: None,
            test_runner: None,
            test_command: None,
            branch_naming: None,
            requirements: None,
            plan: None,
            test_files: Vec::new(),
            code_files: Vec::new(),
            test_results: Vec::new(),
            review_findings: Vec::new(),
            security_findings: Vec::new(),
            security_patches_applied: 0,
            requires_coding_rework: false,
            security_feedback: String::new(),
            status: PipelineStatus::Pending,
            current_step: None,
            error_message: None,
            step_usage: BTreeMap::new(),
            total_cost_usd: 0.0,
            pre_run_sha: None,
            step_commits: BTreeMap::new(),
            worktree_path: None,
        }
    }

    /// The path agents and commits operate on: the worktree when one was
    /// created for this run, otherwise the repository root.
    pub fn effective_path(&self) -> &Path {
        self.worktree_path.as_deref().unwrap_or(&self.project_path)
    }

    /// Ticket number parsed from `task.source_id` (format `ticket:N`).
    pub fn ticket_number(&self) -> Option<i64> {
        let sid = self.task.source_id.as_deref()?;
        sid.strip_prefix("ticket:")?.parse().ok()
    }

    pub fn record_usage(&mut self, step_name: &str, usage: StepUsage) {
        self.total_cost_usd += usage.cost_usd;
        self.step_usage.insert(step_name.to_string(), usage);
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.step_usage.values().map(|u| u.input_tokens).sum()
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.step_usage.values().map(|u| u.output_tokens).sum()
    }
}

/// Run ids are 12-hex-char UUID fragments: short enough for branch names
/// and worktree directories, unique enough for concurrent runs.
fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
