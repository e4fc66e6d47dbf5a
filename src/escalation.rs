//! Failure escalation policy and phase outcomes.
//!
//! A phase attempt starts retry-eligible. The first side-effecting step with
//! an unclear recovery state marks the attempt hold-eligible, and nothing
//! clears the mark for the rest of that attempt. At the outermost failure
//! boundary the mark decides whether the controller reschedules the phase
//! or holds it for an operator.

use crate::collaborators::PlanControl;
use crate::errors::PhaseFailure;

/// Result of one phase invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Success; output properties have been persisted.
    Finished,
    /// Transient failure; the whole phase may be re-run from the top.
    Retry(String),
    /// Failure after an ambiguous side effect; operator action required.
    Hold(String),
    /// The controller asked the phase to pause. Nothing was reported.
    Paused,
}

impl PhaseOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, PhaseOutcome::Finished)
    }
}

/// How a failure is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Hold,
}

/// The per-attempt hold-eligibility flag.
#[derive(Debug, Default)]
pub struct Escalation {
    hold_reason: Option<String>,
}

impl Escalation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a side effect with unclear recovery state has begun.
    /// Only the first reason is kept.
    pub fn mark_side_effect(&mut self, reason: &str) {
        if self.hold_reason.is_none() {
            tracing::info!(reason, "phase is now hold-eligible");
            self.hold_reason = Some(reason.to_string());
        }
    }

    pub fn is_hold_eligible(&self) -> bool {
        self.hold_reason.is_some()
    }

    pub fn hold_reason(&self) -> Option<&str> {
        self.hold_reason.as_deref()
    }

    pub fn classify(&self) -> Disposition {
        if self.is_hold_eligible() {
            Disposition::Hold
        } else {
            Disposition::Retry
        }
    }

    /// Report `failure` to the controller according to the policy.
    pub async fn escalate(&self, control: &dyn PlanControl, failure: PhaseFailure) -> PhaseOutcome {
        let message = failure.to_string();
        match self.classify() {
            Disposition::Hold => {
                tracing::error!(
                    error = %message,
                    hold_reason = self.hold_reason.as_deref().unwrap_or_default(),
                    workspace_id = failure.workspace_id.as_deref().unwrap_or_default(),
                    "phase failed after side effects; holding for operator"
                );
                control.report_hold(message.clone()).await;
                PhaseOutcome::Hold(message)
            }
            Disposition::Retry => {
                tracing::warn!(error = %message, "phase failed; will be retried");
                control.report_retry(message.clone()).await;
                PhaseOutcome::Retry(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PhaseError;
    use crate::testing::FakeControl;

    fn failure() -> PhaseFailure {
        PhaseFailure {
            context: "remapping vnodes".to_string(),
            workspace_id: Some("p.0011aabb".to_string()),
            target: Some("zone-1".to_string()),
            source: PhaseError::RemoteExecution {
                step: "prime workspace".to_string(),
                message: "exited with status 1".to_string(),
            },
        }
    }

    #[test]
    fn test_fresh_attempt_is_retry() {
        assert_eq!(Escalation::new().classify(), Disposition::Retry);
    }

    #[test]
    fn test_mark_is_sticky_and_keeps_first_reason() {
        let mut escalation = Escalation::new();
        escalation.mark_side_effect("workspace created");
        escalation.mark_side_effect("something else");
        assert_eq!(escalation.classify(), Disposition::Hold);
        assert_eq!(escalation.hold_reason(), Some("workspace created"));
    }

    #[tokio::test]
    async fn test_escalate_retry_reports_retry() {
        let control = FakeControl::new();
        let outcome = Escalation::new().escalate(&control, failure()).await;
        assert!(matches!(outcome, PhaseOutcome::Retry(_)));
        assert_eq!(control.retries().len(), 1);
        assert!(control.holds().is_empty());
    }

    #[tokio::test]
    async fn test_escalate_hold_reports_diagnostics() {
        let control = FakeControl::new();
        let mut escalation = Escalation::new();
        escalation.mark_side_effect("workspace created");

        let outcome = escalation.escalate(&control, failure()).await;
        let PhaseOutcome::Hold(message) = outcome else {
            panic!("Expected Hold outcome");
        };
        assert!(message.contains("p.0011aabb"));
        assert!(message.contains("zone-1"));
        assert!(message.contains("exited with status 1"));
        assert_eq!(control.holds(), vec![message]);
        assert!(control.retries().is_empty());
    }
}
