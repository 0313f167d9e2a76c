//! Host-side collaborators for bootfix: the `az` CLI control plane,
//! configuration, credentials, target loading, logging, and run state.

pub mod az_cli;
pub mod config;
pub mod keyring;
pub mod loader;
pub mod logging;
pub mod state;
pub mod util;

pub use az_cli::AzCliControlPlane;
pub use config::Config;
pub use loader::load_targets;
pub use state::{write_run_report, RunLock};
