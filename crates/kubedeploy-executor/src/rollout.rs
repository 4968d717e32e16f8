//! Rollout verification.
//!
//! A rollout check is a blocking `kubectl rollout status --timeout=...` call. kubectl
//! enforces the timeout itself. The verifier adds a deadline of its own on top and kills
//! the process when it passes.

use kubedeploy_core::{Plan, Step};
use std::time::Duration;
use tracing::{info, warn};

use crate::process::{self, Exit};

/// Printed by kubectl when `--timeout` elapses before the rollout completes.
pub const KUBECTL_TIMEOUT_MESSAGE: &str = "timed out waiting for the condition";

/// Result of waiting on one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    Succeeded,
    TimedOut,
    Failed { reason: String },
}

impl RolloutOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RolloutOutcome::Succeeded)
    }
}

/// Waits on rollout status operations.
#[derive(Debug, Clone)]
pub struct RolloutVerifier {
    /// Slack given to kubectl beyond its own timeout before the process is killed.
    grace: Duration,
}

impl Default for RolloutVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RolloutVerifier {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run the rollout status step and classify how it ended.
    pub async fn verify(
        &self,
        plan: &Plan,
        step: Step,
        workload: &str,
        timeout: Duration,
    ) -> RolloutOutcome {
        info!(workload = %workload, timeout_secs = timeout.as_secs(), "Waiting for rollout");

        let deadline = timeout + self.grace;
        let outcome = match tokio::time::timeout(deadline, Self::watch(plan, step)).await {
            Err(_) => {
                warn!(workload = %workload, "Rollout check exceeded its deadline, killing kubectl");
                RolloutOutcome::TimedOut
            }
            Ok(Err(e)) => RolloutOutcome::Failed {
                reason: e.to_string(),
            },
            Ok(Ok(exit)) if exit.success() => RolloutOutcome::Succeeded,
            Ok(Ok(exit)) if exit.stderr_matched => RolloutOutcome::TimedOut,
            Ok(Ok(exit)) => RolloutOutcome::Failed {
                reason: match exit.code() {
                    Some(code) => format!("kubectl exited with code {}", code),
                    None => "kubectl was terminated by a signal".to_string(),
                },
            },
        };

        if outcome.is_success() {
            info!(workload = %workload, "Rollout complete");
        }
        outcome
    }

    async fn watch(plan: &Plan, step: Step) -> Result<Exit, process::ProcessError> {
        match step {
            Step::Single(idx) => {
                process::run_single(&plan.operations[idx], Some(KUBECTL_TIMEOUT_MESSAGE)).await
            }
            Step::Piped { producer, consumer } => {
                let exit = process::run_pair(
                    &plan.operations[producer],
                    &plan.operations[consumer],
                    Some(KUBECTL_TIMEOUT_MESSAGE),
                    |_| {},
                )
                .await?;
                if exit.producer.success() {
                    Ok(exit.consumer)
                } else {
                    // A failed render means nothing was checked.
                    Ok(Exit {
                        status: exit.producer,
                        stderr_matched: false,
                    })
                }
            }
        }
    }
}
