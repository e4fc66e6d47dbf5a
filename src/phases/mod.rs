//! Phases of a reshard plan driven by this engine.
//!
//! | Phase                        | Shape                                          |
//! |------------------------------|------------------------------------------------|
//! | `remap_ring`                 | idempotent sequence with a watchdog-guarded step |
//! | `restart_electric_moray_readonly` | fan-out restart gated on shard convergence |
//!
//! Every phase reports exactly one of finished, retry or hold to the plan
//! controller, or nothing at all when it was paused.

pub mod remap_ring;
pub mod restart_readonly;

pub use crate::escalation::PhaseOutcome;
pub use remap_ring::RemapRing;
pub use restart_readonly::RestartReadOnly;

use crate::collaborators::Collaborators;
use crate::config::ReshardConfig;
use crate::progress::ProgressHub;
use std::fmt;
use std::str::FromStr;
use tracing::Instrument;

/// Everything a phase needs to run.
#[derive(Clone)]
pub struct PhaseEnv {
    pub collaborators: Collaborators,
    pub config: ReshardConfig,
    pub hub: ProgressHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseName {
    RemapRing,
    RestartReadOnly,
}

impl PhaseName {
    pub const ALL: [PhaseName; 2] = [PhaseName::RemapRing, PhaseName::RestartReadOnly];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::RemapRing => "remap_ring",
            PhaseName::RestartReadOnly => "restart_electric_moray_readonly",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PhaseName::RemapRing => "remap vnodes into a new hash ring image",
            PhaseName::RestartReadOnly => {
                "restart every routing-tier instance until both shards are read-only"
            }
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown phase '{}'", s))
    }
}

/// Run the named phase to its outcome.
pub async fn run_phase(name: PhaseName, env: &PhaseEnv) -> PhaseOutcome {
    let span = tracing::info_span!("phase", name = name.as_str());
    let outcome = match name {
        PhaseName::RemapRing => RemapRing::new(env).run().instrument(span).await,
        PhaseName::RestartReadOnly => RestartReadOnly::new(env).run().instrument(span).await,
    };
    tracing::info!(phase = name.as_str(), outcome = ?outcome, "phase complete");
    outcome
}
