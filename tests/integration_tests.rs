//! Integration tests for LevelUp
//!
//! CLI-level tests drive the binary; scenario tests drive the engine with
//! scripted agents against real temporary git repositories and a shared
//! state database, the way concurrent CLI/GUI processes would.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use git2::{BranchType, IndexAddOption, Oid, Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use levelup::agents::{Agent, AgentSet};
use levelup::context::{
    CheckpointDecision, PipelineContext, PipelineStatus, StepUsage, TaskInput,
};
use levelup::detect::{ProjectDetector, ProjectInfo};
use levelup::engine::Engine;
use levelup::errors::AgentError;
use levelup::settings::{PipelineSettings, ProjectSettings, Settings, StateSettings};
use levelup::store::StateStore;
use levelup::workspace::WorkspaceManager;

/// Helper to create a levelup Command
fn levelup() -> Command {
    cargo_bin_cmd!("levelup")
}

fn init_repo(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    fs::write(dir.join("README.md"), "# test project\n").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
}

/// One temp universe: a git project, a state db, and a worktree root.
struct World {
    dir: TempDir,
    project: PathBuf,
    db_path: PathBuf,
}

impl World {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        init_repo(&project);
        let db_path = dir.path().join("state.db");
        Self {
            project,
            db_path,
            dir,
        }
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.db_path).unwrap()
    }

    fn settings(&self) -> Settings {
        Settings {
            project: ProjectSettings {
                path: Some(self.project.clone()),
                ..Default::default()
            },
            pipeline: PipelineSettings {
                checkpoint_poll_interval_ms: 20,
                ..Default::default()
            },
            state: StateSettings {
                db_path: Some(self.db_path.clone()),
                worktree_root: Some(self.dir.path().join("worktrees")),
            },
            ..Default::default()
        }
    }
}

/// Agent that writes one file per invocation under the run's working path.
struct WritingAgent {
    name: &'static str,
    file: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Agent for WritingAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepUsage, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let path = ctx.effective_path().join(self.file);
        fs::write(&path, format!("{} output, call {}\n", self.name, call))
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        Ok(StepUsage {
            cost_usd: 0.01,
            input_tokens: 100,
            output_tokens: 20,
            duration_ms: 5.0,
            num_turns: 1,
        })
    }
}

struct NullDetector;

impl ProjectDetector for NullDetector {
    fn detect(&self, _p: &Path) -> ProjectInfo {
        ProjectInfo::default()
    }
}

fn scripted_agents() -> (AgentSet, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let mut set = AgentSet::new();
    for (name, file) in [
        ("requirements", "requirements.md"),
        ("planning", "plan.md"),
        ("test_writer", "test_a.py"),
        ("coder", "a.py"),
        ("security", "security_report.md"),
        ("reviewer", "review_notes.md"),
    ] {
        set.register(Box::new(WritingAgent {
            name,
            file,
            calls: calls.clone(),
        }));
    }
    (set, calls)
}

fn engine_for(world: &World, headless: bool) -> Engine {
    let (agents, _) = scripted_agents();
    Engine::new(
        world.settings(),
        Some(world.store()),
        Box::new(NullDetector),
        agents,
        !headless,
    )
}

/// Background approver standing in for the GUI process.
fn spawn_approver(
    store: StateStore,
    mut script: Vec<(CheckpointDecision, &'static str)>,
) -> tokio::task::JoinHandle<()> {
    script.reverse();
    tokio::spawn(async move {
        let mut answered = std::collections::HashSet::new();
        while !script.is_empty() {
            for request in store.pending_checkpoints().unwrap_or_default() {
                if !answered.insert(request.id) {
                    continue;
                }
                let Some((decision, feedback)) = script.pop() else {
                    return;
                };
                store.submit_decision(request.id, decision, feedback).unwrap();
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
}

fn branch_commit_count(project: &Path, branch: &str, since: &str) -> usize {
    let repo = Repository::open(project).unwrap();
    let reference = repo
        .find_branch(branch, BranchType::Local)
        .unwrap()
        .into_reference();
    let tip = reference.peel_to_commit().unwrap();
    let stop = Oid::from_str(since).unwrap();
    let mut revwalk = repo.revwalk().unwrap();
    revwalk.push(tip.id()).unwrap();
    revwalk.hide(stop).unwrap();
    revwalk.count()
}

// =============================================================================
// Basic CLI tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_levelup_help() {
        levelup().arg("--help").assert().success();
    }

    #[test]
    fn test_levelup_version() {
        levelup().arg("--version").assert().success();
    }

    #[test]
    fn test_runs_empty_database() {
        let world = World::new();
        levelup()
            .arg("runs")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found"));
    }

    #[test]
    fn test_runs_rejects_bad_status_filter() {
        let world = World::new();
        levelup()
            .arg("runs")
            .arg("--status")
            .arg("exploded")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .failure();
    }

    #[test]
    fn test_checkpoints_empty_database() {
        let world = World::new();
        levelup()
            .arg("checkpoints")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .success()
            .stdout(predicate::str::contains("No pending checkpoints"));
    }

    #[test]
    fn test_sweep_empty_database() {
        let world = World::new();
        levelup()
            .arg("sweep")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .success()
            .stdout(predicate::str::contains("live owner processes"));
    }

    #[test]
    fn test_decide_unknown_request_fails() {
        let world = World::new();
        levelup()
            .arg("decide")
            .arg("999")
            .arg("approve")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("999"));
    }

    #[test]
    fn test_decide_revise_requires_feedback() {
        let world = World::new();
        levelup()
            .arg("decide")
            .arg("1")
            .arg("revise")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("feedback"));
    }

    #[test]
    fn test_show_unknown_run_fails() {
        let world = World::new();
        levelup()
            .arg("show")
            .arg("cafebabe0000")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Binary end-to-end: a run that fails because the agent backend is missing
// =============================================================================

mod cli_run_failure {
    use super::*;

    #[test]
    fn test_missing_agent_executable_fails_run_and_exits_nonzero() {
        let world = World::new();
        fs::write(
            world.project.join("levelup.yaml"),
            format!(
                "llm:\n  claude_executable: levelup-missing-claude-binary\nstate:\n  worktree_root: {}\n",
                world.dir.path().join("worktrees").display()
            ),
        )
        .unwrap();

        levelup()
            .arg("run")
            .arg("Add a login form")
            .arg("--headless")
            .arg("--db-path")
            .arg(&world.db_path)
            .arg("--project-dir")
            .arg(&world.project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("executable not found"));

        // The failure is durably recorded for remote observers.
        let store = world.store();
        let runs = store.list_runs(Some(PipelineStatus::Failed), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(
            runs[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("executable not found")
        );
    }
}

// =============================================================================
// Workspace isolation across concurrent runs
// =============================================================================

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_four_concurrent_runs_get_isolated_workspaces() {
        let world = World::new();
        let host_head_before = {
            let repo = Repository::open(&world.project).unwrap();
            repo.head().unwrap().name().unwrap().to_string()
        };

        let mut handles = Vec::new();
        for i in 0..4 {
            let mut settings = world.settings();
            settings.pipeline.require_checkpoints = false;
            let (agents, _) = scripted_agents();
            let engine = Engine::new(
                settings,
                Some(world.store()),
                Box::new(NullDetector),
                agents,
                false,
            );
            handles.push(tokio::spawn(async move {
                engine
                    .run(TaskInput::manual(format!("Concurrent task {}", i), ""))
                    .await
                    .unwrap()
            }));
        }

        let mut contexts = Vec::new();
        for handle in handles {
            contexts.push(handle.await.unwrap());
        }

        let mut paths = std::collections::HashSet::new();
        let mut branches = std::collections::HashSet::new();
        for ctx in &contexts {
            assert_eq!(ctx.status, PipelineStatus::Completed);
            paths.insert(ctx.worktree_path.clone().unwrap());
            branches.insert(format!("levelup/{}", ctx.run_id));
        }
        assert_eq!(paths.len(), 4);
        assert_eq!(branches.len(), 4);

        // Every branch exists; the host checkout never moved.
        let repo = Repository::open(&world.project).unwrap();
        for branch in &branches {
            assert!(repo.find_branch(branch, BranchType::Local).is_ok());
        }
        assert_eq!(repo.head().unwrap().name().unwrap(), host_head_before);

        // One run's files never leak into another workspace or the host.
        let first = contexts[0].worktree_path.clone().unwrap();
        fs::write(first.join("only_here.txt"), "private").unwrap();
        for ctx in &contexts[1..] {
            assert!(!ctx.worktree_path.clone().unwrap().join("only_here.txt").exists());
        }
        assert!(!world.project.join("only_here.txt").exists());
    }
}

// =============================================================================
// Checkpoint round-trip across store handles
// =============================================================================

mod checkpoints {
    use super::*;

    #[tokio::test]
    async fn test_decision_from_second_connection_reaches_waiting_run() {
        let world = World::new();
        let engine = engine_for(&world, true);

        // Separate handle on the same file, as the GUI would hold.
        let gui_store = StateStore::open(&world.db_path).unwrap();
        let approver = spawn_approver(
            gui_store,
            vec![
                (CheckpointDecision::Revise, "tighten the acceptance criteria"),
                (CheckpointDecision::Approve, ""),
                (CheckpointDecision::Approve, ""),
                (CheckpointDecision::Approve, ""),
                (CheckpointDecision::Approve, ""),
            ],
        );

        let ctx = engine
            .run(TaskInput::manual("Round trip", ""))
            .await
            .unwrap();
        approver.abort();
        assert_eq!(ctx.status, PipelineStatus::Completed);

        // The revise feedback survived the store round-trip verbatim.
        let store = world.store();
        let decided: Vec<_> = {
            let conn_records = store.pending_checkpoints().unwrap();
            assert!(conn_records.is_empty());
            (1..=10)
                .filter_map(|id| store.get_checkpoint_request(id).unwrap())
                .collect()
        };
        let revised = decided
            .iter()
            .find(|r| r.decision == Some(CheckpointDecision::Revise))
            .unwrap();
        assert_eq!(revised.feedback, "tighten the acceptance criteria");
        assert_eq!(revised.step_name, "requirements");
    }
}

// =============================================================================
// Crash detection
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn test_sweep_reclassifies_crashed_run() {
        let world = World::new();
        let store = world.store();

        let mut ctx = PipelineContext::new(
            TaskInput::manual("Crashed run", ""),
            world.project.clone(),
        );
        ctx.status = PipelineStatus::Running;
        store.register_run(&ctx).unwrap();

        // A process that has already exited: its pid is genuinely dead.
        let dead_pid = {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let pid = child.id() as i64;
            child.wait().unwrap();
            pid
        };
        let conn = rusqlite::Connection::open(&world.db_path).unwrap();
        conn.execute(
            "UPDATE runs SET pid = ?1 WHERE run_id = ?2",
            rusqlite::params![dead_pid, ctx.run_id],
        )
        .unwrap();
        drop(conn);

        levelup()
            .arg("sweep")
            .arg("--db-path")
            .arg(&world.db_path)
            .current_dir(&world.project)
            .assert()
            .success()
            .stdout(predicate::str::contains("Marked 1 crashed run(s)"));

        let record = store.get_run(&ctx.run_id).unwrap().unwrap();
        assert_eq!(record.status, PipelineStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Process died"));
    }
}

// =============================================================================
// Ticket guard
// =============================================================================

mod ticket_guard {
    use super::*;

    #[tokio::test]
    async fn test_second_run_for_active_ticket_is_rejected() {
        let world = World::new();
        let store = world.store();

        let mut first = PipelineContext::new(
            TaskInput::from_ticket("First attempt", "", 1),
            world.project.clone(),
        );
        first.status = PipelineStatus::Running;
        store.register_run(&first).unwrap();

        let engine = engine_for(&world, true);
        let err = engine
            .run(TaskInput::from_ticket("Second attempt", "", 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already has an active run"));

        // A terminal first run releases the ticket.
        first.status = PipelineStatus::Aborted;
        store.update_run(&first).unwrap();
        let mut settings = world.settings();
        settings.pipeline.require_checkpoints = false;
        let (agents, _) = scripted_agents();
        let engine = Engine::new(
            settings,
            Some(store.clone()),
            Box::new(NullDetector),
            agents,
            false,
        );
        let ctx = engine
            .run(TaskInput::from_ticket("Third attempt", "", 1))
            .await
            .unwrap();
        assert_eq!(ctx.status, PipelineStatus::Completed);
    }
}

// =============================================================================
// The full scripted scenario: revise at review, approve, complete
// =============================================================================

mod scenario {
    use super::*;

    #[tokio::test]
    async fn test_ticket_run_with_revise_then_approve_completes() {
        let world = World::new();
        let engine = engine_for(&world, true);
        let approver = spawn_approver(
            world.store(),
            vec![
                (CheckpointDecision::Approve, ""), // requirements
                (CheckpointDecision::Approve, ""), // test_writing
                (CheckpointDecision::Approve, ""), // security
                (CheckpointDecision::Revise, "add docstring"), // review
                (CheckpointDecision::Approve, ""), // review, revised
            ],
        );

        let ctx = engine
            .run(TaskInput::from_ticket("Implement login", "Login form", 1))
            .await
            .unwrap();
        approver.abort();

        assert_eq!(ctx.status, PipelineStatus::Completed);

        // The workspace survives completion for inspection and merge.
        let workspace = ctx.worktree_path.clone().unwrap();
        assert!(workspace.exists());
        assert!(workspace.join("a.py").exists());

        // The branch accumulated the step commits (well over the two the
        // coding + revision cycle guarantees).
        let branch = format!("levelup/{}", ctx.run_id);
        let commits = branch_commit_count(
            &world.project,
            &branch,
            ctx.pre_run_sha.as_deref().unwrap(),
        );
        assert!(commits >= 2, "expected >= 2 commits on {}, got {}", branch, commits);

        // Revised review work is recorded separately.
        assert!(ctx.step_commits.contains_key("review_revised"));

        // Explicit cleanup removes the checkout but keeps the branch.
        let mut ctx = ctx;
        let workspace_manager = WorkspaceManager::new(world.settings().worktree_root());
        workspace_manager.cleanup(&mut ctx).unwrap();
        assert!(!workspace.exists());
        let repo = Repository::open(&world.project).unwrap();
        assert!(repo.find_branch(&branch, BranchType::Local).is_ok());
        // Cleanup is idempotent.
        workspace_manager.cleanup(&mut ctx).unwrap();
    }
}
