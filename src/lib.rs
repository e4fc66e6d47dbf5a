pub mod collaborators;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod escalation;
pub mod fanout;
pub mod logging;
pub mod phases;
pub mod plan;
pub mod progress;
pub mod remote;
pub mod sequencer;
pub mod template;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;
