/// External result contract
///
/// Only what the caller may see: no host paths, pids, pgids, engine names or
/// launch-failure details.
use crate::core::types::{ExecutionOutcome, ExecutionResult, LaunchFailureKind, ResourceKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// How a captured stream is represented in the encoded result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEncoding {
    Utf8,
    Base64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodedOutcome {
    Completed { exit_code: i32 },
    TimedOut,
    Signaled { signal: i32 },
    OutputLimitExceeded,
    ResourceLimitExceeded { resource: ResourceKind },
    LaunchFailed { reason: LaunchFailureKind },
    Cancelled,
    InternalError,
}

impl From<&ExecutionOutcome> for EncodedOutcome {
    fn from(outcome: &ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed { exit_code } => EncodedOutcome::Completed {
                exit_code: *exit_code,
            },
            ExecutionOutcome::TimedOut => EncodedOutcome::TimedOut,
            ExecutionOutcome::Signaled { signal } => EncodedOutcome::Signaled { signal: *signal },
            ExecutionOutcome::OutputLimitExceeded => EncodedOutcome::OutputLimitExceeded,
            ExecutionOutcome::ResourceLimitExceeded { which } => {
                EncodedOutcome::ResourceLimitExceeded { resource: *which }
            }
            ExecutionOutcome::LaunchFailed { reason } => {
                EncodedOutcome::LaunchFailed { reason: reason.kind }
            }
            ExecutionOutcome::Cancelled => EncodedOutcome::Cancelled,
            ExecutionOutcome::InternalError { .. } => EncodedOutcome::InternalError,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedResult {
    pub execution_id: String,
    pub stdout: String,
    pub stdout_encoding: StreamEncoding,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_encoding: StreamEncoding,
    pub stderr_truncated: bool,
    pub outcome: EncodedOutcome,
    pub duration_ms: u64,
}

fn encode_stream(bytes: &[u8]) -> (String, StreamEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), StreamEncoding::Utf8),
        Err(_) => (STANDARD.encode(bytes), StreamEncoding::Base64),
    }
}

pub struct ResultEncoder;

impl ResultEncoder {
    pub fn encode(result: &ExecutionResult) -> EncodedResult {
        let (stdout, stdout_encoding) = encode_stream(&result.output.stdout);
        let (stderr, stderr_encoding) = encode_stream(&result.output.stderr);

        EncodedResult {
            execution_id: result.execution_id.to_string(),
            stdout,
            stdout_encoding,
            stdout_truncated: result.output.stdout_truncated,
            stderr,
            stderr_encoding,
            stderr_truncated: result.output.stderr_truncated,
            outcome: EncodedOutcome::from(&result.outcome),
            duration_ms: result.duration.as_millis() as u64,
        }
    }

    pub fn to_json(result: &ExecutionResult) -> serde_json::Result<String> {
        serde_json::to_string(&Self::encode(result))
    }
}
