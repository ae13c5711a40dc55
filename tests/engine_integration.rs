//! Integration tests for the isolation engine seam
//!
//! Stub engines written as shell scripts stand in for a real sandbox binary:
//! they parse the engine command line, run (or pretend to run) the payload and
//! leave a report file behind.

use runbox::config::server::{EngineConfig, ServerConfig};
use runbox::config::types::{ExecutionId, IsolationConfig, Result};
use runbox::core::types::LaunchFailureKind;
use runbox::engine::{EngineReport, IsolationEngine, LocalEngine};
use runbox::kernel::process::ReapStatus;
use runbox::{ExecutionOutcome, ExecutionPool, ExecutionRequest, LimitOverrides, ResourceKind, RunboxError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Writing an executable while another test thread forks can leave the script
// busy (ETXTBSY); serialize the tests that create stub engines.
static STUB_LOCK: Mutex<()> = Mutex::new(());

/// Parses the engine arguments up to `--`, then runs the body
const STUB_PRELUDE: &str = r#"#!/bin/sh
report=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    --report=*) report="${1#--report=}" ;;
    --) shift; break ;;
  esac
  shift
done
"#;

fn write_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine.sh");
    std::fs::write(&path, format!("{STUB_PRELUDE}{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn external_pool(body: &str) -> (tempfile::TempDir, ExecutionPool) {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_stub(dir.path(), body);
    let scratch = dir.path().join("scratch");
    let server = ServerConfig {
        scratch_root: scratch,
        engine: EngineConfig::External {
            path: engine,
            args: Vec::new(),
        },
        ..Default::default()
    };
    let pool = ExecutionPool::from_config(server).unwrap();
    (dir, pool)
}

#[test]
fn test_external_engine_runs_payload() {
    let _guard = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, pool) = external_pool(
        r#""$@"
code=$?
printf 'status:OK\nexitcode:%s\ntime:0.012\nmax-rss:2048\n' "$code" > "$report"
exit 0
"#,
    );

    let result = pool
        .execute(ExecutionRequest::new("sh", "echo via engine; exit 4"))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 4 });
    assert_eq!(result.output.stdout, b"via engine\n");
    assert_eq!(result.usage.cpu_time_ms, 12);
    assert_eq!(result.usage.peak_memory_bytes, 2048 * 1024);
}

#[test]
fn test_external_oom_report_is_memory_violation() {
    let _guard = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, pool) = external_pool(
        r#"printf 'status:SG\nexitsig:9\noom-killed:1\n' > "$report"
kill -9 $$
"#,
    );

    let result = pool
        .execute(ExecutionRequest::new("sh", "true"))
        .unwrap();

    assert_eq!(
        result.outcome,
        ExecutionOutcome::ResourceLimitExceeded {
            which: ResourceKind::Memory
        }
    );
}

#[test]
fn test_external_setup_failure_is_launch_failure() {
    let _guard = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, pool) = external_pool(
        r#"printf 'status:XX\nmessage:cannot create cgroup\n' > "$report"
exit 2
"#,
    );

    let result = pool
        .execute(ExecutionRequest::new("sh", "true"))
        .unwrap();

    match result.outcome {
        ExecutionOutcome::LaunchFailed { reason } => {
            assert_eq!(reason.kind, LaunchFailureKind::EngineSetupFailed);
            assert!(reason.detail.contains("cgroup"));
        }
        other => panic!("expected launch failure, got {:?}", other),
    }
}

#[test]
fn test_external_engine_without_report_is_setup_failure() {
    let _guard = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, pool) = external_pool("exit 1\n");

    let result = pool
        .execute(ExecutionRequest::new("sh", "true"))
        .unwrap();

    assert!(matches!(
        result.outcome,
        ExecutionOutcome::LaunchFailed { ref reason }
            if reason.kind == LaunchFailureKind::EngineSetupFailed
    ));
}

#[test]
fn test_missing_engine_binary_fails_validation() {
    let server = ServerConfig {
        engine: EngineConfig::External {
            path: PathBuf::from("/nonexistent/runbox-engine"),
            args: Vec::new(),
        },
        ..Default::default()
    };
    assert!(matches!(
        ExecutionPool::from_config(server),
        Err(RunboxError::Config(_))
    ));
}

/// Local engine that counts how many commands it was asked to build
struct CountingEngine {
    inner: LocalEngine,
    commands: AtomicUsize,
}

impl IsolationEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn command(&self, config: &IsolationConfig, report_path: &Path) -> Result<Command> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        self.inner.command(config, report_path)
    }

    fn interpret(
        &self,
        config: &IsolationConfig,
        report_path: &Path,
        status: &ReapStatus,
    ) -> EngineReport {
        self.inner.interpret(config, report_path, status)
    }

    fn applied_controls(&self, config: &IsolationConfig) -> Vec<&'static str> {
        self.inner.applied_controls(config)
    }

    fn release(&self, execution_id: &ExecutionId) -> Result<()> {
        self.inner.release(execution_id)
    }
}

#[test]
fn test_rejected_requests_never_reach_the_engine() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(CountingEngine {
        inner: LocalEngine::new(),
        commands: AtomicUsize::new(0),
    });
    let server = ServerConfig {
        scratch_root: root.path().to_path_buf(),
        ..Default::default()
    };
    let pool = ExecutionPool::new(server, engine.clone()).unwrap();

    let too_long = ExecutionRequest::new("sh", "true").with_limits(LimitOverrides {
        wall_time_ms: Some(24 * 60 * 60 * 1000),
        ..Default::default()
    });
    let zero_output = ExecutionRequest::new("sh", "true").with_limits(LimitOverrides {
        output_bytes: Some(0),
        ..Default::default()
    });
    let unknown_runtime = ExecutionRequest::new("cobol", "DISPLAY 'HI'.");
    let empty_source = ExecutionRequest::new("sh", "   \n");

    for request in [too_long, zero_output, unknown_runtime, empty_source] {
        assert!(matches!(pool.execute(request), Err(RunboxError::Config(_))));
    }
    assert_eq!(engine.commands.load(Ordering::SeqCst), 0);
    assert_eq!(pool.metrics().rejected_config, 4);

    let result = pool.execute(ExecutionRequest::new("sh", "true")).unwrap();
    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    assert_eq!(engine.commands.load(Ordering::SeqCst), 1);
}
