//! The remote-approver path — `levelup checkpoints` and `levelup decide`.
//!
//! Any process with access to the store file can decide a pending
//! checkpoint; the waiting run observes the decision within one polling
//! interval.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};

use levelup::checkpoint::CheckpointPayload;
use levelup::context::CheckpointDecision;
use levelup::settings::Settings;
use levelup::store::StateStore;
use levelup::ui;

fn open_store(project_dir: &Path, db_path: Option<&PathBuf>) -> Result<StateStore> {
    let settings = Settings::load(project_dir).context("Failed to load levelup settings")?;
    StateStore::open(settings.db_path(db_path.map(PathBuf::as_path)))
        .context("Failed to open the state database")
}

pub fn cmd_checkpoints(project_dir: &Path, db_path: Option<&PathBuf>) -> Result<()> {
    let store = open_store(project_dir, db_path)?;
    let pending = store.pending_checkpoints()?;
    if pending.is_empty() {
        println!("No pending checkpoints.");
        return Ok(());
    }
    for record in &pending {
        ui::print_checkpoint_record(record);
        if let Some(payload_json) = record.payload_json.as_deref()
            && let Ok(payload) = serde_json::from_str::<CheckpointPayload>(payload_json)
        {
            ui::print_checkpoint_payload(&payload);
        }
    }
    Ok(())
}

pub fn cmd_decide(
    project_dir: &Path,
    db_path: Option<&PathBuf>,
    request_id: i64,
    decision: &str,
    feedback: &str,
) -> Result<()> {
    let decision = CheckpointDecision::from_str(decision).map_err(|e| anyhow::anyhow!(e))?;
    if decision == CheckpointDecision::Revise && feedback.trim().is_empty() {
        bail!("Revise requires feedback: pass --feedback \"...\"");
    }

    let store = open_store(project_dir, db_path)?;
    store.submit_decision(request_id, decision, feedback)?;
    println!("Recorded '{}' for checkpoint request {}.", decision, request_id);
    Ok(())
}
