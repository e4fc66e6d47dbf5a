//! Restart every routing-tier instance until both plan shards are read-only.
//!
//! Instances are restarted a third of the fleet at a time, in a stable
//! order, so a phase that is retried over and over always disturbs the same
//! subset first. Any failure is retried by the controller: a restart has no
//! side effect that a later restart cannot repair.

use super::PhaseEnv;
use crate::collaborators::Collaborators;
use crate::config::ReshardConfig;
use crate::convergence::{ReadOnlyShards, restart_one};
use crate::errors::{PhaseError, PhaseFailure};
use crate::escalation::{Escalation, PhaseOutcome};
use crate::fanout::{FanOut, FanOutConfig, FanOutResult};
use crate::plan::Plan;
use crate::sequencer::{Flow, SequenceResult, StepKind, StepRunner, run_sequence};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ListInstances,
    RestartAll,
}

const STEPS: [Step; 2] = [Step::ListInstances, Step::RestartAll];

pub struct RestartContext {
    pub plan: Plan,
    pub instances: Vec<String>,
}

pub struct RestartReadOnly {
    collab: Collaborators,
    config: ReshardConfig,
}

impl RestartReadOnly {
    pub fn new(env: &PhaseEnv) -> Self {
        Self {
            collab: env.collaborators.clone(),
            config: env.config.clone(),
        }
    }

    pub async fn run(&self) -> PhaseOutcome {
        let control = self.collab.control.as_ref();
        let mut ctx = RestartContext {
            plan: control.plan(),
            instances: Vec::new(),
        };

        match run_sequence(self, &STEPS, &mut ctx, control).await {
            Ok(SequenceResult::Completed) => {
                tracing::info!(instances = ctx.instances.len(), "all instances converged");
                control.report_finished().await;
                PhaseOutcome::Finished
            }
            Ok(SequenceResult::Paused { at }) => {
                tracing::info!(step = at, "restart paused");
                PhaseOutcome::Paused
            }
            Err(source) => {
                let failure = PhaseFailure {
                    context: format!("restarting \"{}\" instances", self.config.restart.service),
                    workspace_id: None,
                    target: None,
                    source,
                };
                Escalation::new().escalate(control, failure).await
            }
        }
    }

    async fn list_instances(&self, ctx: &mut RestartContext) -> Result<Flow, PhaseError> {
        let service = &self.config.restart.service;
        let instances = self
            .collab
            .instances
            .list_instances(service)
            .await
            .map_err(|e| PhaseError::collaborator(format!("listing \"{}\" instances", service), e))?;

        ctx.instances = instances.into_keys().collect();
        ctx.instances.sort();
        Ok(Flow::Continue)
    }

    async fn restart_all(&self, ctx: &mut RestartContext) -> Result<Flow, PhaseError> {
        let total = ctx.instances.len();
        let service = &self.config.restart.service;

        self.collab
            .status
            .update(&format!("restarting all {} \"{}\" instances", total, service));
        tracing::info!(instances = ?ctx.instances, "restarting all instances");

        let gate = ReadOnlyShards::for_plan(&ctx.plan);
        let instances = self.collab.instances.as_ref();
        let fan_out = FanOut::new(
            self.collab.control.as_ref(),
            self.collab.status.clone(),
            FanOutConfig::for_fleet(total, &self.config.restart),
        )
        .with_noun("zone");

        let result = fan_out
            .run(ctx.instances.clone(), |item| {
                let gate = &gate;
                async move {
                    tracing::info!(instance = %item.id, attempt = item.attempt, "restarting instance");
                    restart_one(instances, gate, &item.id, item.status).await?;
                    Ok(())
                }
            })
            .await?;

        match result {
            FanOutResult::Completed => Ok(Flow::Continue),
            FanOutResult::Paused => Ok(Flow::Paused),
        }
    }
}

#[async_trait]
impl StepRunner for RestartReadOnly {
    type Step = Step;
    type Context = RestartContext;

    fn name(step: Step) -> &'static str {
        match step {
            Step::ListInstances => "list instances",
            Step::RestartAll => "restart instances",
        }
    }

    fn kind(step: Step) -> StepKind {
        match step {
            Step::ListInstances => StepKind::Setup,
            Step::RestartAll => StepKind::Work,
        }
    }

    async fn run_step(&self, step: Step, ctx: &mut RestartContext) -> Result<Flow, PhaseError> {
        match step {
            Step::ListInstances => self.list_instances(ctx).await,
            Step::RestartAll => self.restart_all(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressHub;
    use crate::testing::{
        FakeArtifacts, FakeControl, FakeInstances, FakeMetadata, RecordingStatus,
        ScriptedExecutor, test_application, test_plan,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const FLEET: [&str; 10] = [
        "zone-07", "zone-03", "zone-09", "zone-01", "zone-05", "zone-00", "zone-08", "zone-02",
        "zone-06", "zone-04",
    ];

    fn env(control: Arc<FakeControl>, instances: Arc<FakeInstances>, config: ReshardConfig) -> PhaseEnv {
        let hub = ProgressHub::new("http://test");
        PhaseEnv {
            collaborators: Collaborators {
                control,
                metadata: Arc::new(FakeMetadata::new(test_application())),
                artifacts: Arc::new(FakeArtifacts::new()),
                instances,
                executor: Arc::new(ScriptedExecutor::new(hub.clone(), |_call| async {
                    Ok(Default::default())
                })),
                status: RecordingStatus::new(),
            },
            config,
            hub,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_restart_converges_with_one_retry() {
        let control = Arc::new(FakeControl::new());
        let instances = Arc::new(FakeInstances::new(&FLEET, &test_plan()).fail_checks("zone-04", 1));

        let started = tokio::time::Instant::now();
        let outcome = RestartReadOnly::new(&env(control.clone(), instances.clone(), ReshardConfig::default()))
            .run()
            .await;

        assert_eq!(outcome, PhaseOutcome::Finished);
        assert_eq!(control.finished_count(), 1);
        assert_eq!(instances.max_in_flight(), 3);

        let restarts = instances.restarts();
        assert_eq!(restarts.len(), 11);
        let mut first_three = restarts[..3].to_vec();
        first_three.sort();
        assert_eq!(first_three, vec!["zone-00", "zone-01", "zone-02"]);

        assert_eq!(instances.restart_count("zone-04"), 2);
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_instance_is_retry() {
        let control = Arc::new(FakeControl::new());
        let instances = Arc::new(FakeInstances::new(&["zone-a", "zone-b"], &test_plan()).fail_checks("zone-b", 100));
        let mut config = ReshardConfig::default();
        config.restart.max_attempts = 3;

        let outcome = RestartReadOnly::new(&env(control.clone(), instances.clone(), config))
            .run()
            .await;

        let PhaseOutcome::Retry(message) = outcome else {
            panic!("Expected Retry, got {:?}", outcome);
        };
        assert!(message.contains("zone-b"));
        assert!(message.contains("3 attempts"));
        assert_eq!(instances.restart_count("zone-b"), 3);
        assert!(control.holds().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_is_retry() {
        let control = Arc::new(FakeControl::new());
        let instances = Arc::new(FakeInstances::new(&["zone-a"], &test_plan()).fail_listing());

        let outcome = RestartReadOnly::new(&env(control.clone(), instances.clone(), ReshardConfig::default()))
            .run()
            .await;

        assert!(matches!(outcome, PhaseOutcome::Retry(_)));
        assert!(instances.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_mid_fleet_reports_nothing() {
        // Two sequencer checks, then three fan-out checks before the pause.
        let control = Arc::new(FakeControl::new().pause_after_checks(5));
        let instances = Arc::new(FakeInstances::new(&FLEET, &test_plan()));

        let outcome = RestartReadOnly::new(&env(control.clone(), instances.clone(), ReshardConfig::default()))
            .run()
            .await;

        assert_eq!(outcome, PhaseOutcome::Paused);
        assert!(control.nothing_reported());
        assert_eq!(instances.restarts().len(), 3);
    }
}
