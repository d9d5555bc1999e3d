//! CLI command implementations.
//!
//! | Module        | Commands handled                                  |
//! |---------------|---------------------------------------------------|
//! | `run`         | `Run`, `Resume`                                   |
//! | `runs`        | `Runs`, `Show`, `Pause`, `Sweep`, `Delete`, `Cleanup` |
//! | `checkpoints` | `Checkpoints`, `Decide`                           |

pub mod checkpoints;
pub mod run;
pub mod runs;

pub use checkpoints::{cmd_checkpoints, cmd_decide};
pub use run::{cmd_resume, cmd_run};
pub use runs::{cmd_cleanup, cmd_delete, cmd_pause, cmd_runs, cmd_show, cmd_sweep};
