//! Sandboxed execution of analysis scripts
//!
//! Generated code is written in a small Python-flavoured table language
//! which is parsed and interpreted here; there is no host `eval`. The
//! namespace a script sees is fixed: the preloaded datasets, the `pd`
//! namespace and the allow-listed built-ins.
//!
//! Execution happens in a separate worker process (`sift sandbox-worker`)
//! so that the wall-clock deadline can be enforced by killing the worker.
//! A script that never yields is terminated from outside.
//!
//! # Example
//!
//! ```no_run
//! use sift_engine::sandbox::{ProcessSandbox, Sandbox};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sandbox = ProcessSandbox::current_exe()?;
//! let outcome = sandbox
//!     .execute("result = 1 + 1", &Default::default(), Duration::from_secs(5))
//!     .await;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod builtins;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod lexer;
pub mod methods;
pub mod ops;
pub mod parser;
pub mod table_methods;
pub mod value;
pub mod worker;

pub use error::{ErrorKind, ScriptError};
pub use interpreter::{run_script, ScriptFailure, ScriptOutput, RESULT_BINDING};
pub use worker::{run_request, serve_stdio, WorkerRequest, WorkerResponse};

use async_trait::async_trait;
use indexmap::IndexMap;
use sdk::{ResultValue, Table};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Subcommand that puts the `sift` binary into worker mode
pub const WORKER_SUBCOMMAND: &str = "sandbox-worker";

/// Why an execution did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script raised an error
    Runtime,
    /// The script finished without binding `result`
    MissingResult,
    /// The wall-clock deadline expired and the worker was killed
    Timeout,
    /// The worker could not be started or broke the protocol
    WorkerUnavailable,
}

/// Message carried by every `WorkerUnavailable` outcome. The underlying
/// I/O error is logged, not returned.
pub const WORKER_UNAVAILABLE: &str = "sandbox worker unavailable";

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Runtime => "runtime",
            FailureKind::MissingResult => "missing_result",
            FailureKind::Timeout => "timeout",
            FailureKind::WorkerUnavailable => "worker_unavailable",
        }
    }
}

/// Result of running one script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        result: ResultValue,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        stdout: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl ExecutionOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&ResultValue> {
        match self {
            ExecutionOutcome::Success { result, .. } => Some(result),
            ExecutionOutcome::Failure { .. } => None,
        }
    }
}

impl From<WorkerResponse> for ExecutionOutcome {
    fn from(response: WorkerResponse) -> Self {
        match response {
            WorkerResponse::Success { result, stdout } => {
                ExecutionOutcome::Success { result, stdout }
            }
            WorkerResponse::Failure {
                error_type,
                message,
                line,
                missing_result,
                ..
            } => {
                if error_type == "ProtocolError" {
                    warn!("Sandbox worker rejected the request: {}", message);
                    return ExecutionOutcome::failure(
                        FailureKind::WorkerUnavailable,
                        WORKER_UNAVAILABLE,
                    );
                }
                let kind = if missing_result {
                    FailureKind::MissingResult
                } else {
                    FailureKind::Runtime
                };
                let message = match line {
                    Some(line) if line > 0 => format!("{} on line {}: {}", error_type, line, message),
                    _ => format!("{}: {}", error_type, message),
                };
                ExecutionOutcome::failure(kind, message)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to start sandbox worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Sandbox worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sandbox worker protocol error: {0}")]
    Protocol(String),
}

/// Executes validated code against preloaded datasets under a deadline.
///
/// Implementations never fail the caller: every problem, including a
/// worker that cannot be started, is reported as an `ExecutionOutcome`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        datasets: &IndexMap<String, Table>,
        timeout: Duration,
    ) -> ExecutionOutcome;
}

/// Runs each script in a fresh worker process.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Use the running `sift` binary as the worker
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![WORKER_SUBCOMMAND.to_string()],
        ))
    }

    /// Worker command from configuration, defaulting to the running binary
    pub fn from_config(config: &crate::config::PipelineConfig) -> std::io::Result<Self> {
        match &config.worker_program {
            Some(program) => {
                let args = if config.worker_args.is_empty() {
                    vec![WORKER_SUBCOMMAND.to_string()]
                } else {
                    config.worker_args.clone()
                };
                Ok(Self::new(program.clone(), args))
            }
            None => Self::current_exe(),
        }
    }

    fn spawn(&self) -> Result<Child, SandboxError> {
        Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)
    }

    /// Write the request, read the response and reap the child
    async fn exchange(child: &mut Child, payload: Vec<u8>) -> Result<WorkerResponse, SandboxError> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("worker stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("worker stdout unavailable".to_string()))?;

        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let mut output = Vec::new();
        stdout.read_to_end(&mut output).await?;
        let status = child.wait().await?;

        serde_json::from_slice(&output).map_err(|e| {
            SandboxError::Protocol(format!(
                "unreadable response (exit status {}): {}",
                status, e
            ))
        })
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        code: &str,
        datasets: &IndexMap<String, Table>,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let request = WorkerRequest {
            code: code.to_string(),
            datasets: datasets.clone(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode sandbox request: {}", e);
                return ExecutionOutcome::failure(FailureKind::WorkerUnavailable, WORKER_UNAVAILABLE);
            }
        };

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not start sandbox worker: {}", e);
                return ExecutionOutcome::failure(FailureKind::WorkerUnavailable, WORKER_UNAVAILABLE);
            }
        };

        let started = Instant::now();
        match tokio::time::timeout(timeout, Self::exchange(&mut child, payload)).await {
            Ok(Ok(response)) => {
                debug!("Sandbox worker finished in {:?}", started.elapsed());
                ExecutionOutcome::from(response)
            }
            Ok(Err(e)) => {
                warn!("Sandbox worker exchange failed: {}", e);
                let _ = child.start_kill();
                ExecutionOutcome::failure(FailureKind::WorkerUnavailable, WORKER_UNAVAILABLE)
            }
            Err(_) => {
                warn!("Sandbox deadline of {:?} expired, killing worker", timeout);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill sandbox worker: {}", e);
                }
                let _ = child.wait().await;
                ExecutionOutcome::failure(
                    FailureKind::Timeout,
                    format!("execution exceeded {} seconds", timeout.as_secs_f64()),
                )
            }
        }
    }
}
