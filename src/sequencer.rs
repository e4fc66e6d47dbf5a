//! Idempotent phase sequencer.
//!
//! A phase is an ordered list of steps sharing one mutable context. Steps
//! run strictly in order; the controller's pause flag is checked before
//! every step. A runner can mark a stretch of steps as not pausable with
//! [`StepRunner::pausable`]; a pause requested there is held until the
//! next step that is. A step that discovers the expensive work has already been
//! done returns [`Flow::SkipToVerify`], after which every remaining
//! [`StepKind::Work`] step is skipped and the sequence continues at the
//! first non-work step.
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use reshard_phase::errors::PhaseError;
//! use reshard_phase::sequencer::{Flow, StepKind, StepRunner};
//!
//! #[derive(Debug, Clone, Copy)]
//! enum Step { Check, Build, Verify }
//!
//! struct Runner;
//!
//! #[async_trait]
//! impl StepRunner for Runner {
//!     type Step = Step;
//!     type Context = Option<String>;
//!
//!     fn name(step: Step) -> &'static str {
//!         match step { Step::Check => "check", Step::Build => "build", Step::Verify => "verify" }
//!     }
//!
//!     fn kind(step: Step) -> StepKind {
//!         match step { Step::Build => StepKind::Work, Step::Verify => StepKind::Verify, _ => StepKind::Setup }
//!     }
//!
//!     async fn run_step(&self, step: Step, ctx: &mut Option<String>) -> Result<Flow, PhaseError> {
//!         match step {
//!             Step::Check if ctx.is_some() => Ok(Flow::SkipToVerify),
//!             Step::Build => { *ctx = Some("artifact".into()); Ok(Flow::Continue) }
//!             _ => Ok(Flow::Continue),
//!         }
//!     }
//! }
//! ```

use crate::collaborators::PlanControl;
use crate::errors::PhaseError;
use async_trait::async_trait;
use tracing::Instrument;

/// Role of a step within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Always runs (loading templates, reading configuration, ...)
    Setup,
    /// Expensive work skipped once it is known to be done
    Work,
    /// Confirms the phase's result; always runs
    Verify,
}

/// What the sequencer should do after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip every remaining work step.
    SkipToVerify,
    /// The step observed a pause request and stopped early.
    Paused,
}

/// Final state of a sequence that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceResult {
    Completed,
    Paused { at: &'static str },
}

/// The steps of one phase.
#[async_trait]
pub trait StepRunner: Send + Sync {
    type Step: Copy + std::fmt::Debug + Send + Sync;
    type Context: Send;

    fn name(step: Self::Step) -> &'static str;

    fn kind(step: Self::Step) -> StepKind;

    /// Whether the sequence may be suspended before `step`.
    fn pausable(&self, _step: Self::Step, _ctx: &Self::Context) -> bool {
        true
    }

    async fn run_step(&self, step: Self::Step, ctx: &mut Self::Context) -> Result<Flow, PhaseError>;
}

/// Run `steps` in order against `ctx`.
///
/// Returns the first step error unchanged; the caller owns escalation.
pub async fn run_sequence<R: StepRunner>(
    runner: &R,
    steps: &[R::Step],
    ctx: &mut R::Context,
    control: &dyn PlanControl,
) -> Result<SequenceResult, PhaseError> {
    let mut skipping_work = false;
    let mut pause_deferred = false;

    for &step in steps {
        let name = R::name(step);

        if pause_deferred || control.check_pause() {
            if runner.pausable(step, ctx) {
                tracing::info!(step = name, "pause requested; suspending before step");
                return Ok(SequenceResult::Paused { at: name });
            }
            if !pause_deferred {
                tracing::info!(step = name, "pause requested; deferred until the step can be suspended");
                pause_deferred = true;
            }
        }

        if skipping_work && R::kind(step) == StepKind::Work {
            tracing::debug!(step = name, "work already done; skipping");
            continue;
        }

        let span = tracing::info_span!("step", name);
        let flow = runner.run_step(step, ctx).instrument(span).await?;

        match flow {
            Flow::Continue => {}
            Flow::SkipToVerify => {
                tracing::info!(step = name, "skipping remaining work steps");
                skipping_work = true;
            }
            Flow::Paused => {
                tracing::info!(step = name, "step suspended for pause");
                return Ok(SequenceResult::Paused { at: name });
            }
        }
    }

    Ok(SequenceResult::Completed)
}
