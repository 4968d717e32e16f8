//! Error types for kubedeploy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("kubectl install failed: {0}")]
    Install(String),

    #[error("command `{command}` failed with {}", exit_label(.code))]
    Execution { command: String, code: Option<i32> },

    #[error("pipeline `{command}` could not run: {message}")]
    Pipeline { command: String, message: String },

    #[error("rollout of {workload} {reason}")]
    Rollout { workload: String, reason: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
