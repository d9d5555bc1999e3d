//! Per-run git isolation: one branch plus one worktree checkout per run.
//!
//! Concurrent runs share the repository's object database but never a
//! working directory, so one run's file writes cannot leak into another
//! run or into the host checkout. Branch and worktree names derive from
//! the run id, which is globally unique.
//!
//! Cleanup removes only the working-directory checkout; the branch and its
//! commits always remain in the repository for inspection and merge. It is
//! never invoked automatically after a successful run.

pub mod branch;

use std::path::PathBuf;

use chrono::Local;
use git2::{
    BranchType, IndexAddOption, Repository, Signature, WorktreeAddOptions, WorktreePruneOptions,
};
use tracing::warn;

use crate::context::PipelineContext;
use crate::errors::WorkspaceError;

pub struct WorkspaceManager {
    worktree_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(worktree_root: PathBuf) -> Self {
        Self { worktree_root }
    }

    /// Resolve the branch name for a run from its naming convention.
    pub fn branch_name(&self, ctx: &PipelineContext) -> String {
        let convention = ctx.branch_naming.as_deref().unwrap_or("levelup/{run_id}");
        let date = Local::now().format("%Y%m%d").to_string();
        branch::resolve(convention, &ctx.run_id, &ctx.task.title, &date)
    }

    /// Create the run's branch at the current head and check it out into a
    /// dedicated worktree. Fails loudly, leaving no partial state: a run
    /// must never fall back to writing into a shared location.
    pub fn create(&self, ctx: &mut PipelineContext) -> Result<String, WorkspaceError> {
        let repo = Repository::open(&ctx.project_path).map_err(|e| WorkspaceError::OpenRepo {
            path: ctx.project_path.clone(),
            source: e,
        })?;
        let head = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .ok_or(WorkspaceError::UnbornHead)?;

        let branch_name = self.branch_name(ctx);
        if repo.find_branch(&branch_name, BranchType::Local).is_ok() {
            return Err(WorkspaceError::BranchExists(branch_name));
        }

        let path = self.worktree_root.join(&ctx.run_id);
        if path.exists() {
            return Err(WorkspaceError::WorktreeDirExists(path));
        }
        std::fs::create_dir_all(&self.worktree_root)?;

        let created = repo.branch(&branch_name, &head, false)?;
        let reference = created.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Err(e) = repo.worktree(&ctx.run_id, &path, Some(&opts)) {
            // Roll the branch back so a retry starts clean.
            if let Ok(mut stale) = repo.find_branch(&branch_name, BranchType::Local) {
                let _ = stale.delete();
            }
            return Err(WorkspaceError::WorktreeCreate { path, source: e });
        }

        ctx.pre_run_sha = Some(head.id().to_string());
        ctx.worktree_path = Some(path);
        Ok(branch_name)
    }

    /// Re-attach a worktree for a run whose branch already exists, used on
    /// resume when the original checkout is gone.
    pub fn recreate(&self, ctx: &mut PipelineContext) -> Result<(), WorkspaceError> {
        let repo = Repository::open(&ctx.project_path).map_err(|e| WorkspaceError::OpenRepo {
            path: ctx.project_path.clone(),
            source: e,
        })?;
        let branch_name = self.branch_name(ctx);
        let branch = repo.find_branch(&branch_name, BranchType::Local)?;

        // Drop any stale worktree record from the previous checkout.
        if let Ok(stale) = repo.find_worktree(&ctx.run_id) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true).locked(true);
            let _ = stale.prune(Some(&mut opts));
        }
        let path = self.worktree_root.join(&ctx.run_id);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&self.worktree_root)?;

        let reference = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&ctx.run_id, &path, Some(&opts))
            .map_err(|e| WorkspaceError::WorktreeCreate {
                path: path.clone(),
                source: e,
            })?;
        ctx.worktree_path = Some(path);
        Ok(())
    }

    /// Stage and commit everything that changed under the run's working
    /// directory onto the run's branch, tagged with the step label.
    ///
    /// Returns the commit id, or `None` when nothing changed. The host
    /// repository's checked-out branch is never touched: the commit goes
    /// through the worktree's own HEAD.
    pub fn commit_step(
        &self,
        ctx: &mut PipelineContext,
        step_name: &str,
        revised: bool,
    ) -> Result<Option<String>, WorkspaceError> {
        if ctx.pre_run_sha.is_none() {
            return Ok(None);
        }
        let working_path = ctx.effective_path().to_path_buf();
        let repo = Repository::open(&working_path).map_err(|e| WorkspaceError::OpenRepo {
            path: working_path.clone(),
            source: e,
        })?;

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .ok_or(WorkspaceError::UnbornHead)?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("levelup", "levelup@localhost")?;
        let suffix = if revised { ", revised" } else { "" };
        let message = format!(
            "levelup({}{}): {}\n\nRun ID: {}",
            step_name, suffix, ctx.task.title, ctx.run_id
        );
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;

        let key = if revised {
            format!("{}_revised", step_name)
        } else {
            step_name.to_string()
        };
        ctx.step_commits.insert(key, commit_id.to_string());
        Ok(Some(commit_id.to_string()))
    }

    /// Remove the run's working-directory checkout. The branch and its
    /// commits remain in the repository. No-op when the run has no
    /// workspace or the checkout is already gone.
    pub fn cleanup(&self, ctx: &mut PipelineContext) -> Result<(), WorkspaceError> {
        let Some(path) = ctx.worktree_path.clone() else {
            return Ok(());
        };

        let repo = match Repository::open(&ctx.project_path) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(path = %ctx.project_path.display(), error = %e, "repository gone; removing checkout directly");
                if path.exists() {
                    std::fs::remove_dir_all(&path)?;
                }
                ctx.worktree_path = None;
                return Ok(());
            }
        };

        if let Ok(wt) = repo.find_worktree(&ctx.run_id) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true).locked(true);
            if let Err(e) = wt.prune(Some(&mut opts)) {
                warn!(run_id = %ctx.run_id, error = %e, "worktree prune failed; forcing directory removal");
                if path.exists() {
                    std::fs::remove_dir_all(&path)?;
                }
                if let Ok(wt) = repo.find_worktree(&ctx.run_id) {
                    let mut opts = WorktreePruneOptions::new();
                    opts.valid(true).locked(true);
                    let _ = wt.prune(Some(&mut opts));
                }
            }
        }
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }

        ctx.worktree_path = None;
        Ok(())
    }
}
