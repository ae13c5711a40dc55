/// Structured audit events for execution lifecycle
///
/// Events are serialized as one JSON object each and emitted on the
/// `runbox::audit` log target, so the host's logger decides where they go.
use crate::config::types::ExecutionId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const AUDIT_TARGET: &str = "runbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    ExecutionStart,
    ExecutionEnd,
    LaunchFailed,

    // Limit violations
    WallTimeLimitViolation,
    OutputLimitViolation,
    ResourceLimitViolation,

    // Termination
    GracefulKill,
    ForcedKill,
    Cancelled,

    CleanupFailure,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::ExecutionStart | AuditEventType::ExecutionEnd => AuditSeverity::Low,
            AuditEventType::LaunchFailed => AuditSeverity::Medium,
            AuditEventType::WallTimeLimitViolation => AuditSeverity::High,
            AuditEventType::OutputLimitViolation => AuditSeverity::Medium,
            AuditEventType::ResourceLimitViolation => AuditSeverity::High,
            AuditEventType::GracefulKill => AuditSeverity::Medium,
            AuditEventType::ForcedKill => AuditSeverity::High,
            AuditEventType::Cancelled => AuditSeverity::Low,
            AuditEventType::CleanupFailure => AuditSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub execution_id: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, execution_id: &ExecutionId, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            execution_id: execution_id.to_string(),
            details: details.into(),
            runtime: None,
            outcome: None,
        }
    }

    pub fn with_runtime(mut self, runtime: &str) -> Self {
        self.runtime = Some(runtime.to_string());
        self
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event_type":"{:?}","serialize_error":"{}"}}"#, self.event_type, e)
        })
    }

    /// Emit on the audit target at a level matching the severity
    pub fn emit(&self) {
        let line = self.to_json();
        match self.severity {
            AuditSeverity::Critical | AuditSeverity::High => {
                log::warn!(target: AUDIT_TARGET, "{}", line)
            }
            AuditSeverity::Medium | AuditSeverity::Low => {
                log::info!(target: AUDIT_TARGET, "{}", line)
            }
        }
    }
}

/// Shorthand for building and emitting an event
pub fn emit(event_type: AuditEventType, execution_id: &ExecutionId, details: impl Into<String>) {
    AuditEvent::new(event_type, execution_id, details).emit();
}
