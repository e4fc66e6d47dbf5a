//! Watchdog-guarded remote step.
//!
//! A long-lived remote script is started while its progress endpoint and an
//! interval timer are watched concurrently. The first decisive signal wins:
//!
//! - a terminal progress message (`error` fails the step, `finished` succeeds)
//! - the remote call returning: a non-zero exit fails; a zero exit succeeds
//!   once any progress already accepted has been drained; a transport
//!   timeout is ignored when the script has already reported progress
//! - the stall timer: once at least one message has arrived, silence longer
//!   than the stall timeout fails the step
//!
//! When the step resolves, its endpoint is closed so any later POST is
//! rejected instead of reaching the caller.

use crate::collaborators::{ExecOutput, RemoteExecutor, StatusSink};
use crate::config::WatchdogConfig;
use crate::errors::PhaseError;
use crate::progress::{ProgressEndpoint, ProgressEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Which channel resolved the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The script posted a terminal `finished` message.
    ProgressFinished { message: String, total: Option<u64> },
    /// The remote call returned exit status zero.
    ExitStatus,
}

/// Successful outcome of a guarded step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub resolution: Resolution,
    /// Progress messages accepted before resolution.
    pub messages: u32,
    /// Output of the remote call, if it returned before resolution.
    pub output: Option<ExecOutput>,
}

pub struct GuardedRemoteStep<'a> {
    executor: &'a dyn RemoteExecutor,
    status: Arc<dyn StatusSink>,
    stall_timeout: Duration,
    check_interval: Duration,
}

impl<'a> GuardedRemoteStep<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        status: Arc<dyn StatusSink>,
        config: &WatchdogConfig,
    ) -> Self {
        Self {
            executor,
            status,
            stall_timeout: config.stall_timeout(),
            check_interval: config.check_interval(),
        }
    }

    /// Run `script` on `target`, watching `endpoint` for progress.
    ///
    /// The endpoint must be the one whose URL was rendered into `script`.
    /// It is closed and dropped before this returns.
    pub async fn run(
        &self,
        step: &str,
        target: &str,
        script: &str,
        mut endpoint: ProgressEndpoint,
    ) -> Result<StepReport, PhaseError> {
        let node = self.status.child();
        node.update(&format!("{}: starting on {}", step, target));

        let mut watch = Watch::new(step, node.clone());

        let exec = self.executor.execute_remote(target, script);
        tokio::pin!(exec);
        let mut exec_pending = true;
        let mut output: Option<ExecOutput> = None;

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                Some(event) = endpoint.recv() => {
                    if let Some(resolved) = watch.observe(event) {
                        break resolved;
                    }
                }

                returned = &mut exec, if exec_pending => {
                    exec_pending = false;
                    match returned {
                        Err(e) if e.is_transport_timeout() && watch.messages > 0 => {
                            tracing::warn!(
                                step,
                                target_zone = target,
                                messages = watch.messages,
                                "ignoring transport timeout; script has reported progress"
                            );
                            node.update(&format!(
                                "{}: transport timed out, waiting for script to report",
                                step
                            ));
                        }
                        Err(e) => {
                            break Err(PhaseError::RemoteTransport {
                                step: step.to_string(),
                                source: e,
                            });
                        }
                        Ok(out) => {
                            if let Some(resolved) = watch.drain(&mut endpoint) {
                                output = Some(out);
                                break resolved;
                            }
                            if !out.success() {
                                break Err(PhaseError::RemoteExecution {
                                    step: step.to_string(),
                                    message: exit_message(&out),
                                });
                            }
                            tracing::debug!(step, "remote call exited 0");
                            output = Some(out);
                            break Ok(Resolution::ExitStatus);
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Some(last) = watch.last_message {
                        let silence = last.elapsed();
                        if silence > self.stall_timeout {
                            tracing::error!(
                                step,
                                silence_secs = silence.as_secs(),
                                "remote script stalled"
                            );
                            break Err(PhaseError::StallTimeout { silence });
                        }
                    }
                }
            }
        };

        endpoint.close();
        while let Some(late) = endpoint.try_recv() {
            tracing::warn!(step, message = late.message(), "discarding progress message after resolution");
        }
        drop(endpoint);

        match result {
            Ok(resolution) => {
                node.update(&format!("{}: done", step));
                Ok(StepReport {
                    resolution,
                    messages: watch.messages,
                    output,
                })
            }
            Err(e) => {
                node.update(&format!("{}: failed: {}", step, e));
                Err(e)
            }
        }
    }
}

/// Progress bookkeeping for one step.
struct Watch<'s> {
    step: &'s str,
    node: Arc<dyn StatusSink>,
    messages: u32,
    last_message: Option<Instant>,
}

impl<'s> Watch<'s> {
    fn new(step: &'s str, node: Arc<dyn StatusSink>) -> Self {
        Self {
            step,
            node,
            messages: 0,
            last_message: None,
        }
    }

    /// Record one message; returns the resolution if it is terminal.
    fn observe(&mut self, event: ProgressEvent) -> Option<Result<Resolution, PhaseError>> {
        self.messages += 1;
        self.last_message = Some(Instant::now());
        self.node.update(&event.describe());
        tracing::debug!(step = self.step, count = self.messages, "{}", event.describe());

        match event {
            ProgressEvent::Info { .. } => None,
            ProgressEvent::Failed { message } => Some(Err(PhaseError::ScriptFailed { message })),
            ProgressEvent::Finished { message, total } => {
                Some(Ok(Resolution::ProgressFinished { message, total }))
            }
        }
    }

    /// Consume messages accepted before the remote call returned.
    fn drain(&mut self, endpoint: &mut ProgressEndpoint) -> Option<Result<Resolution, PhaseError>> {
        while let Some(event) = endpoint.try_recv() {
            if let Some(resolved) = self.observe(event) {
                return Some(resolved);
            }
        }
        None
    }
}

fn exit_message(out: &ExecOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        format!("exited with status {}", out.exit_status)
    } else {
        format!("exited with status {}: {}", out.exit_status, stderr)
    }
}
