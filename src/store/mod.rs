//! Durable run and checkpoint state shared across processes.

pub mod db;
pub mod models;

pub use db::{StateStore, SUPPORTED_SCHEMA_VERSION};
pub use models::{CheckpointRequestRecord, CheckpointStatus, RunRecord};
