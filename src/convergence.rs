//! Convergence-gated restart of a single routing-tier instance.
//!
//! ```text
//! pending ──restart──▶ restarting ──ok──▶ verifying ──gate──▶ converged
//!                                                   └───────▶ non-converged
//! ```
//!
//! A non-converged instance is reported as a failure so the fan-out
//! executor restarts and re-verifies it after its retry delay.

use crate::collaborators::{InstanceManager, StatusSink};
use crate::errors::PhaseError;
use crate::plan::{Plan, ShardIndexMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Restarting,
    Verifying,
    Converged,
    NonConverged,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Restarting => "restarting",
            InstanceState::Verifying => "verifying",
            InstanceState::Converged => "converged",
            InstanceState::NonConverged => "non-converged",
        };
        f.write_str(s)
    }
}

/// Predicate over an instance's live shard index map.
pub trait ConvergenceGate: Send + Sync {
    /// `Ok` when the desired configuration is in effect, otherwise the reason it is not.
    fn evaluate(&self, map: &ShardIndexMap) -> Result<(), String>;
}

/// Both the source and the destination shard are present and read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyShards {
    pub shard: String,
    pub new_shard: String,
}

impl ReadOnlyShards {
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            shard: plan.shard.clone(),
            new_shard: plan.new_shard.clone(),
        }
    }
}

impl ConvergenceGate for ReadOnlyShards {
    fn evaluate(&self, map: &ShardIndexMap) -> Result<(), String> {
        for shard in [&self.shard, &self.new_shard] {
            match map.get(shard.as_str()) {
                None => return Err(format!("shard {} is missing from the index map", shard)),
                Some(entry) if !entry.read_only => {
                    return Err(format!("shard {} is not read-only", shard));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Restart `instance_id` and check it against `gate`.
///
/// Returns the terminal state reached; a non-converged instance is an
/// error, as is any failure of the management interface.
pub async fn restart_one(
    instances: &dyn InstanceManager,
    gate: &dyn ConvergenceGate,
    instance_id: &str,
    status: Arc<dyn StatusSink>,
) -> Result<InstanceState, PhaseError> {
    let mut state = InstanceState::Pending;
    let step = status.child();

    let mut advance = |next: InstanceState| {
        tracing::debug!(instance = instance_id, from = %state, to = %next, "instance state");
        state = next;
    };

    advance(InstanceState::Restarting);
    step.update("restarting");
    tracing::info!(instance = instance_id, "restarting instance");
    instances
        .restart_instance(instance_id)
        .await
        .map_err(|e| PhaseError::collaborator(format!("restarting instance {}", instance_id), e))?;

    advance(InstanceState::Verifying);
    step.update("checking shard index map");
    let map = instances
        .shard_index_map(instance_id)
        .await
        .map_err(|e| PhaseError::collaborator(format!("fetching index map for {}", instance_id), e))?;

    match gate.evaluate(&map) {
        Ok(()) => {
            advance(InstanceState::Converged);
            Ok(InstanceState::Converged)
        }
        Err(reason) => {
            advance(InstanceState::NonConverged);
            tracing::warn!(instance = instance_id, reason = %reason, "instance has not converged");
            Err(PhaseError::ConvergenceFailure {
                instance: instance_id.to_string(),
                reason,
            })
        }
    }
}
