//! Typed views of state-database rows.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::{CheckpointDecision, PipelineStatus};
use crate::errors::StoreError;

/// A row in the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task_title: String,
    pub task_description: String,
    pub project_path: String,
    pub ticket_number: Option<i64>,
    pub status: PipelineStatus,
    pub current_step: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub test_runner: Option<String>,
    pub error_message: Option<String>,
    pub context_json: Option<String>,
    pub branch_naming: Option<String>,
    pub total_cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub pause_requested: bool,
    pub pid: Option<i64>,
    pub started_at: String,
    pub updated_at: String,
}

/// Status of a checkpoint request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Decided,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Decided => "decided",
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "decided" => Ok(Self::Decided),
            _ => Err(format!("Invalid checkpoint status: {}", s)),
        }
    }
}

/// A row in the `checkpoint_requests` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequestRecord {
    pub id: i64,
    pub run_id: String,
    pub step_name: String,
    pub payload_json: Option<String>,
    pub status: CheckpointStatus,
    pub decision: Option<CheckpointDecision>,
    pub feedback: String,
    pub created_at: String,
    pub decided_at: Option<String>,
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate struct for reading runs before parsing the status string.
pub(crate) struct RunRow {
    pub run_id: String,
    pub task_title: String,
    pub task_description: String,
    pub project_path: String,
    pub ticket_number: Option<i64>,
    pub status: String,
    pub current_step: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub test_runner: Option<String>,
    pub error_message: Option<String>,
    pub context_json: Option<String>,
    pub branch_naming: Option<String>,
    pub total_cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub pause_requested: i64,
    pub pid: Option<i64>,
    pub started_at: String,
    pub updated_at: String,
}

impl RunRow {
    pub fn into_record(self) -> Result<RunRecord, StoreError> {
        let status = PipelineStatus::from_str(&self.status).map_err(StoreError::Corrupt)?;
        Ok(RunRecord {
            run_id: self.run_id,
            task_title: self.task_title,
            task_description: self.task_description,
            project_path: self.project_path,
            ticket_number: self.ticket_number,
            status,
            current_step: self.current_step,
            language: self.language,
            framework: self.framework,
            test_runner: self.test_runner,
            error_message: self.error_message,
            context_json: self.context_json,
            branch_naming: self.branch_naming,
            total_cost_usd: self.total_cost_usd,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            pause_requested: self.pause_requested != 0,
            pid: self.pid,
            started_at: self.started_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate struct for checkpoint request rows.
pub(crate) struct CheckpointRow {
    pub id: i64,
    pub run_id: String,
    pub step_name: String,
    pub payload_json: Option<String>,
    pub status: String,
    pub decision: Option<String>,
    pub feedback: Option<String>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

impl CheckpointRow {
    pub fn into_record(self) -> Result<CheckpointRequestRecord, StoreError> {
        let status = CheckpointStatus::from_str(&self.status).map_err(StoreError::Corrupt)?;
        let decision = self
            .decision
            .map(|d| CheckpointDecision::from_str(&d).map_err(StoreError::Corrupt))
            .transpose()?;
        Ok(CheckpointRequestRecord {
            id: self.id,
            run_id: self.run_id,
            step_name: self.step_name,
            payload_json: self.payload_json,
            status,
            decision,
            feedback: self.feedback.unwrap_or_default(),
            created_at: self.created_at,
            decided_at: self.decided_at,
        })
    }
}
