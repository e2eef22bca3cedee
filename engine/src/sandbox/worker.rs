//! The sandbox worker: the child-process side of `ProcessSandbox`.
//!
//! The worker reads one `WorkerRequest` from stdin, runs the script and
//! writes one `WorkerResponse` to stdout. It never logs; stdout is the
//! protocol channel and stderr is discarded by the parent.

use super::interpreter::run_script;
use indexmap::IndexMap;
use sdk::{ResultValue, Table};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Script plus the datasets it may read, keyed by binding name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub code: String,
    pub datasets: IndexMap<String, Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Success {
        result: ResultValue,
        #[serde(default)]
        stdout: String,
    },
    Failure {
        /// Script-level error class, e.g. `KeyError`
        error_type: String,
        message: String,
        #[serde(default)]
        line: Option<usize>,
        /// The script finished without binding `result`
        #[serde(default)]
        missing_result: bool,
        #[serde(default)]
        stdout: String,
    },
}

pub fn run_request(request: &WorkerRequest) -> WorkerResponse {
    match run_script(&request.code, &request.datasets) {
        Ok(output) => WorkerResponse::Success {
            result: output.value,
            stdout: output.stdout,
        },
        Err(failure) => WorkerResponse::Failure {
            error_type: failure.error.kind.as_str().to_string(),
            message: failure.error.message,
            line: failure.error.line,
            missing_result: failure.missing_result,
            stdout: failure.stdout,
        },
    }
}

/// Serve a single request over stdin/stdout.
pub fn serve_stdio() -> std::io::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let response = match serde_json::from_str::<WorkerRequest>(&input) {
        Ok(request) => run_request(&request),
        Err(e) => WorkerResponse::Failure {
            error_type: "ProtocolError".to_string(),
            message: format!("malformed worker request: {}", e),
            line: None,
            missing_result: false,
            stdout: String::new(),
        },
    };
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response)?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::Scalar;

    #[test]
    fn test_response_wire_format() {
        let response = WorkerResponse::Success {
            result: ResultValue::Scalar(Scalar::Int(3)),
            stdout: String::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["result"], 3);
    }

    #[test]
    fn test_failure_carries_error_type() {
        let request = WorkerRequest {
            code: "result = {}['missing']\n".to_string(),
            datasets: IndexMap::new(),
        };
        match run_request(&request) {
            WorkerResponse::Failure {
                error_type,
                line,
                missing_result,
                ..
            } => {
                assert_eq!(error_type, "KeyError");
                assert_eq!(line, Some(1));
                assert!(!missing_result);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
