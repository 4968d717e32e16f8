//! Operation descriptors and the ordered plan the executor consumes.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::Action;
use crate::env::EnvironmentPatch;
use crate::{Error, Result};

/// What an operation is for. Set by the command builder so that the executor never has
/// to guess from the rendered command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Prints a tool version. Failure is logged, not fatal.
    VersionProbe,
    /// `kubectl config ...` for bare-metal clusters.
    ClusterConfig,
    /// Cloud CLI writing the kubeconfig of a managed cluster.
    KubeconfigFetch,
    /// `kustomize edit set image`, mutating the kustomization in place.
    ImageEdit,
    /// `kustomize build`, only ever run as the producer side of a pipe.
    TemplateBuild,
    /// apply / delete / diff against the manifests.
    Action(Action),
    /// Blocking `kubectl rollout status` for one workload.
    RolloutStatus { workload: String, timeout: Duration },
}

impl OperationKind {
    pub fn is_informational(&self) -> bool {
        matches!(self, OperationKind::VersionProbe)
    }
}

/// Where an operation's standard input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinSource {
    /// Inherited from the invoking process.
    #[default]
    Inherit,
    /// Standard output of the operation at this index in the same plan.
    PipeFrom(usize),
}

/// One external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub stdin_source: StdinSource,
    pub ignore_non_zero_exit: bool,
    /// Merged into this process's environment only.
    pub env: EnvironmentPatch,
}

impl OperationDescriptor {
    pub fn new<I, S>(kind: OperationKind, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_directory: None,
            stdin_source: StdinSource::Inherit,
            ignore_non_zero_exit: false,
            env: EnvironmentPatch::new(),
        }
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn piped_from(mut self, producer: usize) -> Self {
        self.stdin_source = StdinSource::PipeFrom(producer);
        self
    }

    pub fn ignoring_non_zero_exit(mut self, ignore: bool) -> Self {
        self.ignore_non_zero_exit = ignore;
        self
    }

    pub fn with_env(mut self, env: &EnvironmentPatch) -> Self {
        self.env.merge(env);
        self
    }

    /// `program arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// A unit of execution: one process, or a producer/consumer pair joined by a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Single(usize),
    Piped { producer: usize, consumer: usize },
}

impl Step {
    /// Index whose outcome decides the step's outcome.
    pub fn primary(&self) -> usize {
        match self {
            Step::Single(idx) => *idx,
            Step::Piped { consumer, .. } => *consumer,
        }
    }
}

/// Ordered operations for one run. Execution order is list order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub operations: Vec<OperationDescriptor>,
    /// Suppresses command-line tracing and redacts commands in errors.
    pub sensitive: bool,
}

impl Plan {
    pub fn new(sensitive: bool) -> Self {
        Self {
            operations: Vec::new(),
            sensitive,
        }
    }

    /// Append an operation and return its index.
    pub fn push(&mut self, op: OperationDescriptor) -> usize {
        self.operations.push(op);
        self.operations.len() - 1
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&OperationDescriptor> {
        self.operations.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OperationDescriptor> {
        self.operations.iter()
    }

    /// Group operations into execution steps.
    ///
    /// A producer appears only inside the pair of the consumer that references it. Each
    /// producer feeds exactly one consumer that comes after it, and neither side of a
    /// pair may itself be part of another pipe.
    pub fn steps(&self) -> Result<Vec<Step>> {
        let mut is_producer = vec![false; self.operations.len()];

        for (idx, op) in self.operations.iter().enumerate() {
            let StdinSource::PipeFrom(producer) = op.stdin_source else {
                continue;
            };
            let invalid = |message: &str| Error::Pipeline {
                command: op.command_line(),
                message: message.to_string(),
            };
            if producer >= idx {
                return Err(invalid("input must come from an earlier operation"));
            }
            if is_producer[producer] {
                return Err(invalid("producer already feeds another operation"));
            }
            if self.operations[producer].stdin_source != StdinSource::Inherit {
                return Err(invalid("producer is itself reading from a pipe"));
            }
            is_producer[producer] = true;
        }

        let mut steps = Vec::with_capacity(self.operations.len());
        for (idx, op) in self.operations.iter().enumerate() {
            if is_producer[idx] {
                if op.stdin_source != StdinSource::Inherit {
                    return Err(Error::Pipeline {
                        command: op.command_line(),
                        message: "operation is both a producer and a consumer".to_string(),
                    });
                }
                continue;
            }
            steps.push(match op.stdin_source {
                StdinSource::Inherit => Step::Single(idx),
                StdinSource::PipeFrom(producer) => Step::Piped {
                    producer,
                    consumer: idx,
                },
            });
        }
        Ok(steps)
    }

    /// Shell-like rendering of a step, e.g. `kustomize build /m | kubectl apply -f -`.
    pub fn render_step(&self, step: Step) -> String {
        match step {
            Step::Single(idx) => self.operations[idx].command_line(),
            Step::Piped { producer, consumer } => format!(
                "{} | {}",
                self.operations[producer].command_line(),
                self.operations[consumer].command_line()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(program: &str, args: &[&str]) -> OperationDescriptor {
        OperationDescriptor::new(OperationKind::VersionProbe, program, args.iter().copied())
    }

    #[test]
    fn test_command_line() {
        let op = op("kubectl", &["apply", "-f", "./"]);
        assert_eq!(op.command_line(), "kubectl apply -f ./");
        assert_eq!(op.to_string(), "kubectl apply -f ./");
    }

    #[test]
    fn test_steps_fold_producer_into_pair() {
        let mut plan = Plan::new(false);
        plan.push(op("kubectl", &["version"]));
        let producer = plan.push(op("kustomize", &["build", "/m"]));
        plan.push(op("kubectl", &["apply", "-f", "-"]).piped_from(producer));

        let steps = plan.steps().unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Single(0),
                Step::Piped {
                    producer: 1,
                    consumer: 2
                }
            ]
        );
        assert_eq!(
            plan.render_step(steps[1]),
            "kustomize build /m | kubectl apply -f -"
        );
    }

    #[test]
    fn test_steps_reject_forward_reference() {
        let mut plan = Plan::new(false);
        plan.push(op("kubectl", &["apply", "-f", "-"]).piped_from(1));
        plan.push(op("kustomize", &["build", "/m"]));

        assert!(matches!(plan.steps(), Err(Error::Pipeline { .. })));
    }

    #[test]
    fn test_steps_reject_shared_producer() {
        let mut plan = Plan::new(false);
        let producer = plan.push(op("kustomize", &["build", "/m"]));
        plan.push(op("kubectl", &["apply", "-f", "-"]).piped_from(producer));
        plan.push(op("kubectl", &["diff", "-f", "-"]).piped_from(producer));

        assert!(plan.steps().is_err());
    }

    #[test]
    fn test_steps_reject_chained_pipes() {
        let mut plan = Plan::new(false);
        let first = plan.push(op("kustomize", &["build", "/m"]));
        let second = plan.push(op("tee", &["out.yaml"]).piped_from(first));
        plan.push(op("kubectl", &["apply", "-f", "-"]).piped_from(second));

        assert!(plan.steps().is_err());
    }

    #[test]
    fn test_step_primary_is_consumer() {
        let step = Step::Piped {
            producer: 3,
            consumer: 4,
        };
        assert_eq!(step.primary(), 4);
        assert_eq!(Step::Single(2).primary(), 2);
    }
}
