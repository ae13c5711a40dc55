//! End-to-end tests for the execution pool and supervisor
//!
//! These run real `/bin/sh` payloads under the local engine, so they need a
//! Linux host but no privileges.

use runbox::config::server::ServerConfig;
use runbox::config::types::RejectReason;
use runbox::runtime::languages::{javascript, python};
use runbox::engine::LocalEngine;
use runbox::verdict::encoder::{EncodedOutcome, StreamEncoding};
use runbox::{
    ExecutionOutcome, ExecutionPool, ExecutionRequest, LimitOverrides, ResourceKind,
    ResultEncoder, RunboxError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool_on(engine: Arc<LocalEngine>, capacity: usize) -> (tempfile::TempDir, ExecutionPool) {
    let root = tempfile::tempdir().unwrap();
    let mut server = ServerConfig {
        scratch_root: root.path().to_path_buf(),
        ..Default::default()
    };
    server.limits.max_concurrent_executions = capacity;
    let pool = ExecutionPool::new(server, engine).unwrap();
    (root, pool)
}

fn pool_with(capacity: usize) -> (tempfile::TempDir, ExecutionPool) {
    pool_on(Arc::new(LocalEngine::new()), capacity)
}

fn sh(source: &str) -> ExecutionRequest {
    ExecutionRequest::new("sh", source)
}

fn wall(ms: u64) -> LimitOverrides {
    LimitOverrides {
        wall_time_ms: Some(ms),
        ..Default::default()
    }
}

#[test]
fn test_hello_world_completes() {
    let (root, pool) = pool_with(2);
    let result = pool.execute(sh("printf hello")).unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    assert_eq!(result.output.stdout, b"hello");
    assert!(result.output.stderr.is_empty());
    assert!(!result.output.any_truncated());

    // Execution directory is gone once the result exists
    assert!(!root.path().join(result.execution_id.as_str()).exists());
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_nonzero_exit_code_is_reported() {
    let (_root, pool) = pool_with(1);
    let result = pool.execute(sh("echo oops >&2; exit 3")).unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 3 });
    assert_eq!(result.output.stderr, b"oops\n");
}

#[test]
fn test_fatal_signal_is_reported() {
    let (_root, pool) = pool_with(1);
    let result = pool.execute(sh("kill -SEGV $$")).unwrap();

    assert_eq!(
        result.outcome,
        ExecutionOutcome::Signaled {
            signal: libc::SIGSEGV
        }
    );
}

#[test]
fn test_stdin_is_delivered() {
    let (_root, pool) = pool_with(1);
    let result = pool
        .execute(sh("cat").with_stdin("line one\nline two\n"))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    assert_eq!(result.output.stdout, b"line one\nline two\n");
}

#[test]
fn test_environment_is_scrubbed() {
    std::env::set_var("RUNBOX_TEST_SECRET", "leaked");
    let (_root, pool) = pool_with(1);
    let result = pool
        .execute(sh("echo \"[$RUNBOX_TEST_SECRET]\"; pwd"))
        .unwrap();

    let stdout = String::from_utf8(result.output.stdout).unwrap();
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("[]"));
    // Runs inside its own scratch directory
    assert!(lines.next().unwrap().ends_with("/box"));
}

#[test]
fn test_wall_time_limit_kills_sleeper() {
    let (_root, pool) = pool_with(1);
    let started = Instant::now();
    let result = pool
        .execute(sh("sleep 30").with_limits(wall(500)))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "sleeper outlived its deadline: {:?}",
        started.elapsed()
    );
    assert_eq!(pool.metrics().timed_out, 1);
}

#[test]
fn test_sigterm_ignoring_program_is_force_killed() {
    let (_root, pool) = pool_with(1);
    let started = Instant::now();
    let result = pool
        .execute(sh("trap '' TERM; while :; do sleep 1; done").with_limits(wall(500)))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(8));
}

/// Live (non-zombie) members of process group `pgid`
fn live_group_members(pgid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                return false;
            };
            // "pid (comm) state ppid pgrp ..."; comm may contain spaces
            let Some((_, rest)) = stat.rsplit_once(") ") else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            fields.len() > 2 && fields[2] == pgid.to_string() && !matches!(fields[0], "Z" | "X")
        })
        .collect()
}

/// Killed processes need a moment to finish dying
fn residual_members(pgid: i32) -> Vec<i32> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let members = live_group_members(pgid);
        if members.is_empty() || Instant::now() >= deadline {
            return members;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Parses the "<leader> <background>" line the descendant scripts print first
fn leader_and_child(stdout: &[u8]) -> (i32, i32) {
    let text = String::from_utf8_lossy(stdout);
    let mut pids = text
        .split_whitespace()
        .map(|field| field.parse::<i32>().unwrap());
    (pids.next().unwrap(), pids.next().unwrap())
}

#[test]
fn test_timeout_leaves_no_descendants() {
    let (_root, pool) = pool_with(1);
    let result = pool
        .execute(sh("sleep 37 & echo $$ $!; sleep 37").with_limits(wall(500)))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    let (leader, child) = leader_and_child(&result.output.stdout);
    let residual = residual_members(leader);
    assert!(
        residual.is_empty(),
        "group {leader} still has {residual:?} (background sleep was {child})"
    );
}

#[test]
fn test_natural_exit_leaves_no_descendants() {
    let (_root, pool) = pool_with(1);
    let started = Instant::now();
    let result = pool
        .execute(sh("sleep 37 & echo $$ $!; exit 0").with_limits(wall(10_000)))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    // The leader's exit ends the execution, not the background child
    assert!(started.elapsed() < Duration::from_secs(5));
    let (leader, _child) = leader_and_child(&result.output.stdout);
    assert_eq!(residual_members(leader), Vec::<i32>::new());
}

#[test]
fn test_memory_overrun_is_a_resource_violation() {
    let engine = Arc::new(LocalEngine::new());
    let cgroup = engine.memory_cgroup().is_some();
    let (_root, pool) = pool_on(engine, 1);
    let limits = LimitOverrides {
        memory_bytes: Some(32 * 1024 * 1024),
        wall_time_ms: Some(15_000),
        ..Default::default()
    };
    // Command substitution holds the whole 100MB string in the shell's heap
    let result = pool
        .execute(sh("x=$(head -c 100000000 /dev/zero | tr '\\0' x); echo ${#x}").with_limits(limits))
        .unwrap();

    if cgroup {
        assert_eq!(
            result.outcome,
            ExecutionOutcome::ResourceLimitExceeded {
                which: ResourceKind::Memory
            }
        );
        assert_eq!(pool.metrics().resource_limit_exceeded, 1);
    } else {
        eprintln!("cgroup v2 not writable; checking the RLIMIT_AS fallback only");
        assert_ne!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    }
}

#[test]
fn test_execution_cgroup_is_removed() {
    let engine = Arc::new(LocalEngine::new());
    let Some(cgroup_root) = engine.memory_cgroup().map(|root| root.path().to_path_buf()) else {
        eprintln!("cgroup v2 not writable; skipping");
        return;
    };
    let (_root, pool) = pool_on(engine, 1);
    let result = pool.execute(sh("sleep 37 & echo started")).unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    assert!(!cgroup_root.join(result.execution_id.as_str()).exists());
}

#[test]
fn test_python_allocation_past_the_cap_is_a_memory_violation() {
    if !Path::new(python::DEFAULT_INTERPRETER).exists() {
        eprintln!("{} not installed; skipping", python::DEFAULT_INTERPRETER);
        return;
    }
    let engine = Arc::new(LocalEngine::new());
    if engine.memory_cgroup().is_none() {
        eprintln!("cgroup v2 not writable; memory violations are not observable");
        return;
    }
    let (_root, pool) = pool_on(engine, 1);
    let limits = LimitOverrides {
        memory_bytes: Some(64 * 1024 * 1024),
        ..Default::default()
    };
    let result = pool
        .execute(
            ExecutionRequest::new("python", "x = bytearray(1024 * 1024 * 1024)\nprint(len(x))\n")
                .with_limits(limits),
        )
        .unwrap();

    assert_eq!(
        result.outcome,
        ExecutionOutcome::ResourceLimitExceeded {
            which: ResourceKind::Memory
        }
    );
}

#[test]
fn test_node_hello_world_runs_under_default_limits() {
    if !Path::new(javascript::DEFAULT_INTERPRETER).exists() {
        eprintln!("{} not installed; skipping", javascript::DEFAULT_INTERPRETER);
        return;
    }
    let engine = Arc::new(LocalEngine::new());
    if engine.memory_cgroup().is_none() {
        // RLIMIT_AS leaves V8 no room to reserve its code range
        eprintln!("cgroup v2 not writable; node cannot start under RLIMIT_AS");
        return;
    }
    let (_root, pool) = pool_on(engine, 1);
    let result = pool
        .execute(ExecutionRequest::new("node", "console.log('hi from node')"))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
    assert_eq!(result.output.stdout, b"hi from node\n");
}

#[test]
fn test_output_cap_truncates_and_classifies() {
    let (_root, pool) = pool_with(1);
    let limits = LimitOverrides {
        wall_time_ms: Some(1000),
        output_bytes: Some(1000),
        ..Default::default()
    };
    let result = pool
        .execute(sh("while :; do echo xxxxxxxxxxxxxxx; done").with_limits(limits))
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::OutputLimitExceeded);
    assert_eq!(result.output.stdout.len(), 1000);
    assert!(result.output.stdout_truncated);
    assert!(!result.output.stderr_truncated);
}

#[test]
fn test_cpu_limit_is_a_resource_violation() {
    let (_root, pool) = pool_with(1);
    let limits = LimitOverrides {
        cpu_time_ms: Some(1000),
        wall_time_ms: Some(10_000),
        ..Default::default()
    };
    let result = pool
        .execute(sh("while :; do :; done").with_limits(limits))
        .unwrap();

    assert_eq!(
        result.outcome,
        ExecutionOutcome::ResourceLimitExceeded {
            which: ResourceKind::CpuTime
        }
    );
    assert!(result.usage.cpu_time_ms >= 900);
}

#[test]
fn test_cancel_while_running() {
    let (_root, pool) = pool_with(1);
    let admission = pool
        .admit(sh("sleep 30").with_limits(wall(10_000)))
        .unwrap();
    let id = admission.execution_id().clone();

    let started = Instant::now();
    let result = std::thread::scope(|s| {
        let worker = s.spawn(move || admission.run());
        std::thread::sleep(Duration::from_millis(300));
        assert!(pool.cancel(&id));
        worker.join().unwrap()
    });

    assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!pool.cancel(&id), "finished execution still cancellable");
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_capacity_plus_one_rejects_exactly_one() {
    let capacity = 3;
    let (_root, pool) = pool_with(capacity);

    std::thread::scope(|s| {
        let workers: Vec<_> = (0..capacity)
            .map(|_| {
                let admission = pool.admit(sh("sleep 1")).unwrap();
                s.spawn(move || admission.run())
            })
            .collect();

        assert_eq!(pool.active(), capacity);
        let rejected = pool.admit(sh("echo late"));
        assert!(matches!(
            rejected,
            Err(RunboxError::AdmissionRejected(RejectReason::AtCapacity))
        ));

        for worker in workers {
            let result = worker.join().unwrap();
            assert_eq!(result.outcome, ExecutionOutcome::Completed { exit_code: 0 });
        }
    });

    let metrics = pool.metrics();
    assert_eq!(metrics.admitted, capacity as u64);
    assert_eq!(metrics.rejected_at_capacity, 1);
    assert_eq!(metrics.completed, capacity as u64);
    assert_eq!(pool.active(), 0);

    // Slots are free again
    assert!(pool.execute(sh("true")).is_ok());
}

#[test]
fn test_over_ceiling_override_is_rejected_up_front() {
    let (_root, pool) = pool_with(1);
    let request = sh("true").with_limits(LimitOverrides {
        memory_bytes: Some(u64::MAX),
        ..Default::default()
    });

    assert!(matches!(pool.execute(request), Err(RunboxError::Config(_))));
    assert_eq!(pool.metrics().admitted, 0);
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_encoded_result_hides_host_details() {
    let (root, pool) = pool_with(1);
    let result = pool.execute(sh("printf '\\377\\376'")).unwrap();
    let encoded = ResultEncoder::encode(&result);

    assert_eq!(encoded.outcome, EncodedOutcome::Completed { exit_code: 0 });
    assert_eq!(encoded.stdout_encoding, StreamEncoding::Base64);
    assert_eq!(encoded.stdout, "//4=");
    assert_eq!(encoded.execution_id, result.execution_id.to_string());

    let json = ResultEncoder::to_json(&result).unwrap();
    assert!(!json.contains(root.path().to_str().unwrap()));
    assert!(!json.contains("local"));
}
