//! The pipeline engine: drives the ordered steps of one run, applies
//! checkpoint decisions, and keeps the run record current.
//!
//! State machine: pending → running, with excursions to waiting_for_input
//! (headless checkpoint) and paused (cooperative pause between steps), and
//! the terminal states completed / failed / aborted.
//!
//! Step-local failures are recorded on the context and surfaced through the
//! run record rather than thrown: the caller only observes persisted state,
//! and the owning process turns a terminal failure into a non-zero exit.

use tracing::{error, info, warn};

use crate::agents::AgentSet;
use crate::checkpoint::CheckpointCoordinator;
use crate::context::{CheckpointDecision, PipelineContext, PipelineStatus, TaskInput};
use crate::detect::ProjectDetector;
use crate::errors::{EngineError, StoreError};
use crate::journal::RunJournal;
use crate::pipeline::{self, PipelineStep, StepType};
use crate::settings::Settings;
use crate::store::StateStore;
use crate::ui;
use crate::workspace::{WorkspaceManager, branch};

/// Whether the step loop keeps going after a checkpoint.
enum Flow {
    Continue,
    Stop,
}

pub struct Engine {
    settings: Settings,
    store: Option<StateStore>,
    detector: Box<dyn ProjectDetector>,
    agents: AgentSet,
    workspace: WorkspaceManager,
    coordinator: CheckpointCoordinator,
    quiet: bool,
}

impl Engine {
    /// `interactive` selects terminal checkpoints and progress output;
    /// headless runs resolve checkpoints through the store instead.
    pub fn new(
        settings: Settings,
        store: Option<StateStore>,
        detector: Box<dyn ProjectDetector>,
        agents: AgentSet,
        interactive: bool,
    ) -> Self {
        let workspace = WorkspaceManager::new(settings.worktree_root());
        let coordinator = CheckpointCoordinator::new(
            interactive,
            settings.pipeline.checkpoint_poll_interval(),
        );
        Self {
            settings,
            store,
            detector,
            agents,
            workspace,
            coordinator,
            quiet: !interactive,
        }
    }

    /// Execute the full pipeline for a task. Returns the final context;
    /// the run's fate is in `context.status`, not in the `Result` — an
    /// `Err` here means the run could not even be registered.
    pub async fn run(&self, task: TaskInput) -> Result<PipelineContext, EngineError> {
        let project_path = self
            .settings
            .project
            .path
            .clone()
            .map_or_else(std::env::current_dir, Ok)
            .map_err(|e| EngineError::Other(e.into()))?;
        let mut ctx = PipelineContext::new(task, project_path);

        // Guard: one active run per ticket, checked before any work begins.
        if let (Some(store), Some(ticket)) = (&self.store, ctx.ticket_number())
            && let Some(active) = store.active_run_for_ticket(&ctx.project_path, ticket)?
        {
            return Err(EngineError::TicketBusy {
                ticket,
                run_id: active.run_id,
                status: active.status.as_str().to_string(),
            });
        }

        if self.settings.pipeline.create_git_branch && ctx.branch_naming.is_none() {
            ctx.branch_naming = Some(branch::normalize_convention("levelup/{run_id}"));
        }
        ctx.status = PipelineStatus::Running;
        if let Some(store) = &self.store {
            store.register_run(&ctx)?;
        }
        info!(run_id = %ctx.run_id, task = %ctx.task.title, "run registered");

        // Workspace isolation before any agent runs. Failure here aborts
        // the run: writing into a shared location is never acceptable.
        if self.settings.pipeline.create_git_branch {
            match self.workspace.create(&mut ctx) {
                Ok(branch_name) => {
                    if !self.quiet {
                        ui::print_success(&format!(
                            "Created branch {} (workspace {})",
                            branch_name,
                            ctx.effective_path().display()
                        ));
                    }
                }
                Err(e) => {
                    error!(run_id = %ctx.run_id, error = %e, "workspace creation failed");
                    ctx.status = PipelineStatus::Failed;
                    ctx.error_message = Some(format!("Workspace creation failed: {}", e));
                    self.persist(&mut ctx);
                    return Ok(ctx);
                }
            }
        }

        let journal = RunJournal::new(&ctx);
        journal.write_header(&ctx);

        self.execute_steps(&mut ctx, pipeline::default_pipeline(), &journal)
            .await?;
        self.finish(&mut ctx, &journal);
        Ok(ctx)
    }

    /// Continue a persisted run from its recorded step (or an explicit
    /// one), reconstructing the context from the stored snapshot.
    pub async fn resume(
        &self,
        run_id: &str,
        from_step: Option<&str>,
    ) -> Result<PipelineContext, EngineError> {
        let store = self.store.as_ref().ok_or(EngineError::StoreRequired)?;
        let record = store
            .get_run(run_id)?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        let snapshot = record
            .context_json
            .as_deref()
            .ok_or_else(|| EngineError::NoSnapshot(run_id.to_string()))?;
        let mut ctx: PipelineContext = serde_json::from_str(snapshot)
            .map_err(|e| StoreError::Corrupt(format!("context snapshot: {}", e)))?;

        let target = from_step
            .map(str::to_string)
            .or_else(|| ctx.current_step.clone())
            .ok_or(EngineError::NothingToResume)?;
        let start = pipeline::step_index(&target)
            .ok_or_else(|| EngineError::UnknownStep(target.clone()))?;

        ctx.status = PipelineStatus::Running;
        ctx.error_message = None;
        store.claim_run(run_id, PipelineStatus::Running)?;
        info!(run_id, step = %target, "resuming run");

        // Restore the isolated checkout if this run had one and it is gone.
        let checkout_missing = ctx.worktree_path.as_ref().is_some_and(|wt| !wt.exists());
        if checkout_missing
            && let Err(e) = self.workspace.recreate(&mut ctx)
        {
            warn!(run_id, error = %e, "could not re-create worktree; falling back to project path");
            ctx.worktree_path = None;
        }

        let journal = RunJournal::new(&ctx);
        journal.log_resume(&target);

        self.execute_steps(&mut ctx, &pipeline::default_pipeline()[start..], &journal)
            .await?;
        self.finish(&mut ctx, &journal);
        Ok(ctx)
    }

    /// Shared tail of `run` and `resume`.
    fn finish(&self, ctx: &mut PipelineContext, journal: &RunJournal) {
        if ctx.status == PipelineStatus::Running {
            ctx.status = PipelineStatus::Completed;
        }
        if ctx.status == PipelineStatus::Paused {
            info!(run_id = %ctx.run_id, "run paused");
            self.persist(ctx);
            return;
        }

        journal.log_outcome(ctx);
        if ctx.status == PipelineStatus::Completed {
            // The journal itself is part of the branch's history.
            if let Err(e) = self.workspace.commit_step(ctx, "documentation", false) {
                warn!(run_id = %ctx.run_id, error = %e, "failed to commit run journal");
            }
            ctx.current_step = None;
        }
        // The workspace is deliberately left in place, whatever the
        // outcome: completed work stays available for merge, and failed or
        // aborted runs stay inspectable. Removal is an explicit operator
        // action (`levelup cleanup`).
        self.persist(ctx);

        if !self.quiet {
            ui::print_pipeline_summary(ctx);
        }
    }

    async fn execute_steps(
        &self,
        ctx: &mut PipelineContext,
        steps: &[PipelineStep],
        journal: &RunJournal,
    ) -> Result<(), EngineError> {
        for step in steps {
            // Cooperative pause, checked only at step boundaries: an
            // in-flight agent call always runs to its own completion.
            // Recording this step as current means resume continues at the
            // next unexecuted step.
            if let Some(store) = &self.store
                && store.is_pause_requested(&ctx.run_id)?
            {
                ctx.current_step = Some(step.name.to_string());
                ctx.status = PipelineStatus::Paused;
                return Ok(());
            }

            ctx.current_step = Some(step.name.to_string());
            self.persist(ctx);
            if !self.quiet {
                ui::print_step_header(step.name, step.description);
            }

            match step.step_type {
                StepType::Detection => self.run_detection(ctx),
                StepType::Agent => {
                    let Some(agent_name) = step.agent_name else {
                        error!(step = step.name, "agent step without an agent; skipping");
                        continue;
                    };
                    self.run_agent_with_retry(agent_name, ctx).await;

                    if step.name == "security" && ctx.status != PipelineStatus::Failed {
                        self.security_rework(ctx).await;
                    }
                    if ctx.status == PipelineStatus::Failed {
                        return Ok(());
                    }
                }
            }

            journal.log_step(step.name, ctx);
            self.commit_step(ctx, step.name, false);

            if step.checkpoint_after && self.settings.pipeline.require_checkpoints {
                match self.run_checkpoint(ctx, step, journal).await? {
                    Flow::Continue => {}
                    Flow::Stop => return Ok(()),
                }
            }
        }
        Ok(())
    }

    fn run_detection(&self, ctx: &mut PipelineContext) {
        let info = self.detector.detect(&ctx.project_path);
        // Operator-configured values win over detection.
        ctx.language = self.settings.project.language.clone().or(info.language);
        ctx.framework = self.settings.project.framework.clone().or(info.framework);
        ctx.test_runner = info.test_runner;
        ctx.test_command = self
            .settings
            .project
            .test_command
            .clone()
            .or(info.test_command);
    }

    /// One checkpoint, including its REVISE loop. Each revision re-invokes
    /// the step's agent with the feedback merged in, then re-presents the
    /// checkpoint; the cycle bound guarantees termination.
    async fn run_checkpoint(
        &self,
        ctx: &mut PipelineContext,
        step: &PipelineStep,
        journal: &RunJournal,
    ) -> Result<Flow, EngineError> {
        let mut revisions = 0u32;
        loop {
            let (decision, feedback) = self
                .coordinator
                .request_decision(self.store.as_ref(), ctx, step.name)
                .await?;
            journal.log_checkpoint(step.name, decision.as_str(), &feedback);

            match decision {
                CheckpointDecision::Approve => {
                    if !self.quiet {
                        ui::print_success(&format!("Checkpoint '{}' approved.", step.name));
                    }
                    return Ok(Flow::Continue);
                }
                CheckpointDecision::Reject => {
                    info!(run_id = %ctx.run_id, step = step.name, "checkpoint rejected; aborting");
                    ctx.status = PipelineStatus::Aborted;
                    self.persist(ctx);
                    return Ok(Flow::Stop);
                }
                CheckpointDecision::Revise => {
                    revisions += 1;
                    if revisions > self.settings.pipeline.max_revision_cycles {
                        ctx.status = PipelineStatus::Failed;
                        ctx.error_message = Some(format!(
                            "Checkpoint '{}' exceeded {} revision cycles",
                            step.name, self.settings.pipeline.max_revision_cycles
                        ));
                        self.persist(ctx);
                        return Ok(Flow::Stop);
                    }
                    let Some(agent_name) = step.agent_name else {
                        return Ok(Flow::Continue);
                    };
                    self.run_agent_with_feedback(agent_name, ctx, &feedback).await;
                    if ctx.status == PipelineStatus::Failed {
                        return Ok(Flow::Stop);
                    }
                    self.commit_step(ctx, step.name, true);
                }
            }
        }
    }

    /// Security loop-back: when the security agent demands rework, re-run
    /// the coder with the security feedback merged in, then re-check.
    /// Bounded; when cycles run out the flag is cleared and the checkpoint
    /// gets the final say.
    async fn security_rework(&self, ctx: &mut PipelineContext) {
        let mut cycles = 0u32;
        while ctx.requires_coding_rework && ctx.status != PipelineStatus::Failed {
            if cycles >= self.settings.pipeline.max_rework_cycles {
                warn!(
                    run_id = %ctx.run_id,
                    "security issues remain after {} rework cycle(s); deferring to checkpoint",
                    cycles
                );
                ctx.requires_coding_rework = false;
                return;
            }
            cycles += 1;
            info!(run_id = %ctx.run_id, cycle = cycles, "security rework: re-running coder");

            let feedback = std::mem::take(&mut ctx.security_feedback);
            let original = ctx.task.description.clone();
            ctx.task.description = format!(
                "{}\n\n[SECURITY REVIEW FEEDBACK]\n{}",
                original, feedback
            );
            self.run_agent_with_retry("coder", ctx).await;
            ctx.task.description = original;
            if ctx.status == PipelineStatus::Failed {
                return;
            }
            self.commit_step(ctx, "coding", true);

            ctx.requires_coding_rework = false;
            self.run_agent_with_retry("security", ctx).await;
            if ctx.status == PipelineStatus::Failed {
                return;
            }
            self.commit_step(ctx, "security", true);
        }
    }

    /// Run an agent with bounded retries. Exhausted retries, or an
    /// unrecoverable error, fail the run with the collaborator's message.
    async fn run_agent_with_retry(&self, agent_name: &str, ctx: &mut PipelineContext) {
        let Some(agent) = self.agents.get(agent_name) else {
            error!(agent = agent_name, "agent not registered; skipping step");
            return;
        };

        let retries = self.settings.pipeline.max_agent_retries;
        for attempt in 0..=retries {
            let spinner = (!self.quiet).then(|| ui::agent_spinner(agent_name));
            let result = agent.run(ctx).await;
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }

            match result {
                Ok(usage) => {
                    ctx.record_usage(agent_name, usage);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < retries => {
                    warn!(
                        agent = agent_name,
                        attempt = attempt + 1,
                        error = %e,
                        "agent failed; retrying"
                    );
                }
                Err(e) => {
                    error!(agent = agent_name, error = %e, "agent failed");
                    ctx.status = PipelineStatus::Failed;
                    ctx.error_message = Some(format!("Agent {} failed: {}", agent_name, e));
                    if !self.quiet {
                        ui::print_error(ctx.error_message.as_deref().unwrap_or_default());
                    }
                    return;
                }
            }
        }
    }

    /// Re-run an agent with revision feedback merged into its task, then
    /// restore the original description.
    async fn run_agent_with_feedback(
        &self,
        agent_name: &str,
        ctx: &mut PipelineContext,
        feedback: &str,
    ) {
        let original = ctx.task.description.clone();
        ctx.task.description = format!("{}\n\nUSER REVISION FEEDBACK: {}", original, feedback);
        self.run_agent_with_retry(agent_name, ctx).await;
        ctx.task.description = original;
    }

    /// Commit failures are logged, not fatal: losing a step commit is
    /// recoverable, losing the run is not.
    fn commit_step(&self, ctx: &mut PipelineContext, step_name: &str, revised: bool) {
        if let Err(e) = self.workspace.commit_step(ctx, step_name, revised) {
            warn!(run_id = %ctx.run_id, step = step_name, error = %e, "step commit failed");
        }
    }

    fn persist(&self, ctx: &mut PipelineContext) {
        if let Some(store) = &self.store
            && let Err(e) = store.update_run(ctx)
        {
            warn!(run_id = %ctx.run_id, error = %e, "failed to persist run state");
        }
    }

    /// Remove a run's workspace checkout. Exposed for the explicit
    /// `cleanup` operator action and for abort/rollback paths.
    pub fn cleanup_workspace(&self, ctx: &mut PipelineContext) -> Result<(), EngineError> {
        self.workspace.cleanup(ctx)?;
        self.persist(ctx);
        Ok(())
    }
}
