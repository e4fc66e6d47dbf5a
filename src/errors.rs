//! Typed error hierarchy for the reshard phase engine.
//!
//! Top-level enums per subsystem:
//! - `PhaseError` - every failure a phase can surface to its completion handler
//! - `RemoteError` - remote execution transport failures
//! - `FanOutError` - bounded fan-out executor failures
//! - `TemplateError` - script template loading and rendering
//!
//! `PhaseFailure` is the diagnostic wrapper applied once at the outermost
//! boundary of a phase, before the escalation policy runs.

use std::time::Duration;
use thiserror::Error;

/// Errors from remote execution on a compute zone.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote call exceeded its transport budget. The script itself may
    /// still be running on the target.
    #[error("remote execution on {target} exceeded its transport budget of {budget:?}")]
    TransportTimeout { target: String, budget: Duration },

    #[error("remote execution on {target} failed: {source}")]
    Failed {
        target: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RemoteError {
    pub fn is_transport_timeout(&self) -> bool {
        matches!(self, RemoteError::TransportTimeout { .. })
    }
}

/// Errors from loading or rendering script templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("script template '{name}' not found")]
    NotFound { name: String },

    #[error("failed to read script template at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script template '{name}' is not valid UTF-8")]
    InvalidEncoding { name: String },

    #[error("script template '{template}' references unknown variable {variable}")]
    UnknownVariable { template: String, variable: String },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// An external interface call failed (network, not-found, ...).
    #[error("{operation}: {source}")]
    Collaborator {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("found multiple artifacts for plan {plan}: {}", .artifacts.join(", "))]
    AmbiguousState { plan: String, artifacts: Vec<String> },

    #[error("{step}: {message}")]
    RemoteExecution { step: String, message: String },

    #[error("{step}: {source}")]
    RemoteTransport {
        step: String,
        #[source]
        source: RemoteError,
    },

    #[error("progress protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("step run out of order: {0}")]
    OutOfOrder(String),

    #[error("remote script failed: {message}")]
    ScriptFailed { message: String },

    #[error("remote process has not reported back in {} seconds", .silence.as_secs())]
    StallTimeout { silence: Duration },

    #[error("instance {instance} has not converged: {reason}")]
    ConvergenceFailure { instance: String, reason: String },

    #[error("invalid artifact id from script: \"{0}\"")]
    InvalidArtifactId(String),

    #[error(transparent)]
    FanOut(#[from] FanOutError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl PhaseError {
    /// Wrap a collaborator call failure with the operation that was attempted.
    pub fn collaborator(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        PhaseError::Collaborator {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Errors from the bounded fan-out executor.
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("item {item} failed after {attempts} attempts: {source}")]
    Exhausted {
        item: String,
        attempts: u32,
        #[source]
        source: Box<PhaseError>,
    },

    #[error("item {item} failed: {source}")]
    NonRetryable {
        item: String,
        #[source]
        source: Box<PhaseError>,
    },
}

/// A phase failure decorated with the diagnostics an operator needs for triage.
#[derive(Debug, Error)]
#[error("{context} (workspace {}, target {}): {}", display_opt(.workspace_id), display_opt(.target), cause_chain(.source))]
pub struct PhaseFailure {
    pub context: String,
    pub workspace_id: Option<String>,
    pub target: Option<String>,
    #[source]
    pub source: PhaseError,
}

fn display_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("none")
}

/// Render an error and every cause beneath it as `a: b: c`, skipping causes
/// whose text is already contained in the parent message.
pub fn cause_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        current = cause.source();
    }
    rendered
}
