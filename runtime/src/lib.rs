//! Configuration, logging, and the claim/execute daemon loop for the
//! coworker task runtime. Sits above `coworker-store`/`coworker-core` and
//! below the CLI front doors.

pub mod config;
pub mod daemon;
pub mod tracing_init;

pub use config::{CoworkerConfig, load_config, runtime_enabled};
pub use daemon::{DaemonResult, cancel_task, run_loop, run_once};
pub use tracing_init::init_tracing;
