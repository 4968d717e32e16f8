//! Spawning operations as child processes.

use kubedeploy_core::OperationDescriptor;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which half of a producer/consumer pair is currently being awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    ProducerRunning,
    ConsumerRunning,
}

/// Failures to run a process at all, as opposed to a process exiting nonzero.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed to connect {producer} to {consumer}: {source}")]
    Pipe {
        producer: String,
        consumer: String,
        source: io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait { program: String, source: io::Error },
}

/// How a process ended.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub status: ExitStatus,
    /// Whether a watched pattern appeared on stderr.
    pub stderr_matched: bool,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Exit of both halves of a pair.
#[derive(Debug, Clone, Copy)]
pub struct PairExit {
    pub producer: ExitStatus,
    pub consumer: Exit,
}

/// Build the command for an operation with all streams inherited.
pub fn command(op: &OperationDescriptor) -> Command {
    let mut cmd = Command::new(&op.program);
    cmd.args(&op.args)
        .envs(op.env.iter())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = &op.working_directory {
        cmd.current_dir(dir);
    }
    cmd
}

/// Run one operation to completion.
///
/// With `watch` set, stderr is forwarded line by line to our own stderr and scanned
/// for the pattern.
pub async fn run_single(
    op: &OperationDescriptor,
    watch: Option<&str>,
) -> Result<Exit, ProcessError> {
    let mut cmd = command(op);
    if watch.is_some() {
        cmd.stderr(Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: op.program.clone(),
        source,
    })?;
    let watcher = watch.and_then(|pattern| {
        child
            .stderr
            .take()
            .map(|stderr| forward_stderr(stderr, pattern.to_string()))
    });

    let status = child.wait().await.map_err(|source| ProcessError::Wait {
        program: op.program.clone(),
        source,
    })?;

    Ok(Exit {
        status,
        stderr_matched: join_watcher(watcher).await,
    })
}

/// Run a producer and a consumer joined by a pipe.
///
/// The consumer starts first so its stdin exists, the write end of that pipe becomes the
/// producer's stdout, then the producer starts. The producer is awaited before the
/// consumer; both exits are returned together.
pub async fn run_pair(
    producer: &OperationDescriptor,
    consumer: &OperationDescriptor,
    watch: Option<&str>,
    mut on_phase: impl FnMut(PairPhase),
) -> Result<PairExit, ProcessError> {
    let mut consumer_cmd = command(consumer);
    consumer_cmd.stdin(Stdio::piped());
    if watch.is_some() {
        consumer_cmd.stderr(Stdio::piped());
    }

    let mut consumer_child = consumer_cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: consumer.program.clone(),
        source,
    })?;
    let watcher = watch.and_then(|pattern| {
        consumer_child
            .stderr
            .take()
            .map(|stderr| forward_stderr(stderr, pattern.to_string()))
    });

    let pipe_error = |source: io::Error| ProcessError::Pipe {
        producer: producer.program.clone(),
        consumer: consumer.program.clone(),
        source,
    };
    let pipe: Stdio = match consumer_child.stdin.take() {
        Some(stdin) => match TryInto::<Stdio>::try_into(stdin) {
            Ok(pipe) => pipe,
            Err(e) => {
                abort(&mut consumer_child).await;
                return Err(pipe_error(e));
            }
        },
        None => {
            abort(&mut consumer_child).await;
            return Err(pipe_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "consumer stdin was not captured",
            )));
        }
    };

    // The command keeps its copy of the write end until it is dropped, and the consumer
    // only sees EOF once every copy is closed.
    let spawned = {
        let mut producer_cmd = command(producer);
        producer_cmd.stdout(pipe);
        producer_cmd.spawn()
    };
    let mut producer_child = match spawned {
        Ok(child) => child,
        Err(source) => {
            abort(&mut consumer_child).await;
            return Err(ProcessError::Spawn {
                program: producer.program.clone(),
                source,
            });
        }
    };

    on_phase(PairPhase::ProducerRunning);
    let producer_status = match producer_child.wait().await {
        Ok(status) => status,
        Err(source) => {
            abort(&mut consumer_child).await;
            return Err(ProcessError::Wait {
                program: producer.program.clone(),
                source,
            });
        }
    };
    debug!(program = %producer.program, status = %producer_status, "Producer finished");

    on_phase(PairPhase::ConsumerRunning);
    let consumer_status = consumer_child
        .wait()
        .await
        .map_err(|source| ProcessError::Wait {
            program: consumer.program.clone(),
            source,
        })?;

    Ok(PairExit {
        producer: producer_status,
        consumer: Exit {
            status: consumer_status,
            stderr_matched: join_watcher(watcher).await,
        },
    })
}

async fn abort(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to stop consumer after pipe failure");
    }
}

fn forward_stderr(stderr: ChildStderr, pattern: String) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut matched = false;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    matched |= line.contains(&pattern);
                    eprintln!("{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Error reading stderr");
                    break;
                }
            }
        }
        matched
    })
}

async fn join_watcher(watcher: Option<JoinHandle<bool>>) -> bool {
    match watcher {
        Some(handle) => handle.await.unwrap_or(false),
        None => false,
    }
}
