//! Remote script execution.
//!
//! - [`local`]: a [`RemoteExecutor`](crate::collaborators::RemoteExecutor)
//!   that runs scripts through the local shell, for development and tests
//! - [`watchdog`]: the guarded step that runs a long-lived script and decides
//!   completion from its exit status, its progress messages and a stall timer

pub mod local;
pub mod watchdog;

pub use local::LocalShellExecutor;
pub use watchdog::{GuardedRemoteStep, Resolution, StepReport};
