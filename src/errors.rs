//! Typed error hierarchy for the LevelUp orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` — state database open/migration/query failures
//! - `WorkspaceError` — branch and worktree failures (never retried)
//! - `AgentError` — external agent collaborator failures (retried, bounded)
//! - `EngineError` — pipeline engine failures and guard violations

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the shared state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open state database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error(
        "State database schema version {found} is newer than supported version {supported}; upgrade levelup"
    )]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Checkpoint request {0} not found")]
    RequestNotFound(i64),

    #[error("Checkpoint request {0} has already been decided")]
    AlreadyDecided(i64),

    #[error("A pending checkpoint request already exists for run {run_id} step {step_name}")]
    PendingRequestExists { run_id: String, step_name: String },

    #[error("Corrupt row in state database: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from branch and worktree management. These are never retried:
/// partial repository state is worse than a failed run.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to open git repository at {path}: {source}")]
    OpenRepo {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Branch '{0}' already exists; refusing to reuse it")]
    BranchExists(String),

    #[error("Repository has no commits to branch from")]
    UnbornHead,

    #[error("Worktree directory {0} already exists")]
    WorktreeDirExists(PathBuf),

    #[error("Failed to create worktree at {path}: {source}")]
    WorktreeCreate {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from an external agent collaborator.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent executable is missing entirely. Retrying cannot help.
    #[error("'{0}' executable not found on PATH")]
    ExecutableNotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl AgentError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ExecutableNotFound(_))
    }
}

/// Errors from the pipeline engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Ticket #{ticket} already has an active run {run_id} ({status})")]
    TicketBusy {
        ticket: i64,
        run_id: String,
        status: String,
    },

    #[error("Unknown pipeline step '{0}'")]
    UnknownStep(String),

    #[error("No step to resume from: the run has no recorded step and --from-step was not given")]
    NothingToResume,

    #[error("Run {0} has no saved context snapshot to resume from")]
    NoSnapshot(String),

    #[error("Headless checkpoints require a state store")]
    StoreRequired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_schema_too_new_names_both_versions() {
        let err = StoreError::SchemaTooNew {
            found: 9,
            supported: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn store_error_pending_request_carries_run_and_step() {
        let err = StoreError::PendingRequestExists {
            run_id: "abc123".into(),
            step_name: "review".into(),
        };
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("review"));
    }

    #[test]
    fn agent_error_executable_not_found_is_not_retryable() {
        assert!(!AgentError::ExecutableNotFound("claude".into()).is_retryable());
        assert!(AgentError::Failed("timeout".into()).is_retryable());
    }

    #[test]
    fn engine_error_converts_from_store_error() {
        let inner = StoreError::RunNotFound("xyz".into());
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Store(StoreError::RunNotFound(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::RunNotFound("x".into()));
        assert_std_error(&WorkspaceError::BranchExists("b".into()));
        assert_std_error(&AgentError::Failed("x".into()));
        assert_std_error(&EngineError::NothingToResume);
    }
}
