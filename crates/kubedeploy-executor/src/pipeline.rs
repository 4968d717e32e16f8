//! Pipeline executor - runs a plan's steps strictly in order.

use kubedeploy_core::{Error, OperationKind, Plan, Result, Step};
use tracing::{debug, error, info, warn};

use crate::process::{self, PairPhase, ProcessError};
use crate::rollout::{RolloutOutcome, RolloutVerifier};

const REDACTED: &str = "<redacted>";

/// State of an operation during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    /// Both halves of a pipe are live; the phase says which one is being awaited.
    Piping(PairPhase),
    Succeeded,
    /// An informational operation failed and the run carried on.
    Tolerated { message: String },
    Failed { message: String },
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded
                | OperationState::Tolerated { .. }
                | OperationState::Failed { .. }
        )
    }
}

/// Result of a run: the final state of every operation and the error that stopped it.
#[derive(Debug)]
pub struct RunReport {
    pub states: Vec<OperationState>,
    pub failure: Option<Error>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<Vec<OperationState>> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.states),
        }
    }
}

/// Executes plans. Stops at the first failure; nothing is retried.
#[derive(Debug, Clone, Default)]
pub struct PipelineExecutor {
    verifier: RolloutVerifier,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verifier(verifier: RolloutVerifier) -> Self {
        Self { verifier }
    }

    pub async fn execute(&self, plan: &Plan) -> RunReport {
        let mut states = vec![OperationState::Pending; plan.len()];

        let steps = match plan.steps() {
            Ok(steps) => steps,
            Err(e) => {
                error!(error = %e, "Plan is not executable");
                return RunReport {
                    states,
                    failure: Some(e),
                };
            }
        };

        for step in steps {
            let kind = &plan.operations[step.primary()].kind;
            if !plan.sensitive {
                info!("$ {}", plan.render_step(step));
            }

            let result = match kind {
                OperationKind::RolloutStatus { workload, timeout } => {
                    set_state(&mut states, step, OperationState::Running);
                    match self.verifier.verify(plan, step, workload, *timeout).await {
                        RolloutOutcome::Succeeded => Ok(()),
                        RolloutOutcome::TimedOut => Err(Error::Rollout {
                            workload: workload.clone(),
                            reason: format!(
                                "timed out after {}",
                                humantime::format_duration(*timeout)
                            ),
                        }),
                        RolloutOutcome::Failed { reason } => Err(Error::Rollout {
                            workload: workload.clone(),
                            reason: format!("failed: {}", reason),
                        }),
                    }
                }
                _ => Self::run_step(plan, step, &mut states).await,
            };

            match result {
                Ok(()) => {
                    debug!("Command completed successfully");
                    set_state(&mut states, step, OperationState::Succeeded);
                }
                Err(e) if kind.is_informational() => {
                    warn!(error = %e, "Informational command failed, continuing");
                    set_state(
                        &mut states,
                        step,
                        OperationState::Tolerated {
                            message: e.to_string(),
                        },
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to execute a command");
                    set_state(
                        &mut states,
                        step,
                        OperationState::Failed {
                            message: e.to_string(),
                        },
                    );
                    return RunReport {
                        states,
                        failure: Some(e),
                    };
                }
            }
        }

        RunReport {
            states,
            failure: None,
        }
    }

    async fn run_step(plan: &Plan, step: Step, states: &mut [OperationState]) -> Result<()> {
        let command = || {
            if plan.sensitive {
                REDACTED.to_string()
            } else {
                plan.render_step(step)
            }
        };
        let could_not_run = |e: ProcessError| Error::Pipeline {
            command: command(),
            message: if plan.sensitive {
                "process could not be started or joined".to_string()
            } else {
                e.to_string()
            },
        };

        match step {
            Step::Single(idx) => {
                let op = &plan.operations[idx];
                states[idx] = OperationState::Running;
                let exit = process::run_single(op, None)
                    .await
                    .map_err(could_not_run)?;

                if exit.success() {
                    Ok(())
                } else if op.ignore_non_zero_exit {
                    info!(code = ?exit.code(), "Ignoring nonzero exit");
                    Ok(())
                } else {
                    Err(Error::Execution {
                        command: command(),
                        code: exit.code(),
                    })
                }
            }
            Step::Piped { producer, consumer } => {
                let producer_op = &plan.operations[producer];
                let consumer_op = &plan.operations[consumer];
                let exit = process::run_pair(producer_op, consumer_op, None, |phase| {
                    debug!(?phase, "Pipe phase");
                    states[producer] = OperationState::Piping(phase);
                    states[consumer] = OperationState::Piping(phase);
                })
                .await
                .map_err(could_not_run)?;

                if !exit.producer.success() {
                    return Err(Error::Execution {
                        command: command(),
                        code: exit.producer.code(),
                    });
                }
                if exit.consumer.success() {
                    Ok(())
                } else if consumer_op.ignore_non_zero_exit {
                    info!(code = ?exit.consumer.code(), "Ignoring nonzero exit");
                    Ok(())
                } else {
                    Err(Error::Execution {
                        command: command(),
                        code: exit.consumer.code(),
                    })
                }
            }
        }
    }
}

fn set_state(states: &mut [OperationState], step: Step, state: OperationState) {
    match step {
        Step::Single(idx) => states[idx] = state,
        Step::Piped { producer, consumer } => {
            states[producer] = state.clone();
            states[consumer] = state;
        }
    }
}
