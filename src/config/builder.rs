//! Request to isolation config translation
//!
//! Pure apart from path allocation: nothing here touches the filesystem or
//! spawns anything, so a rejected request leaves no trace on the host.

use crate::config::server::ServerConfig;
use crate::config::types::{
    ExecutionId, ExecutionRequest, FilesystemPolicy, IsolationConfig, LimitOverrides,
    ResolvedLimits, Result, RunboxError, ServerLimits,
};
use crate::runtime::RuntimeRegistry;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Execution directory for one id: `<scratch_root>/<id>`
pub fn execution_dir(scratch_root: &Path, id: &ExecutionId) -> PathBuf {
    scratch_root.join(id.as_str())
}

/// Writable scratch dir for one id: `<scratch_root>/<id>/box`
pub fn scratch_dir(scratch_root: &Path, id: &ExecutionId) -> PathBuf {
    execution_dir(scratch_root, id).join("box")
}

/// Narrow server ceilings by per-request overrides.
/// An override must be non-zero and no larger than its ceiling.
pub fn resolve_limits(overrides: &LimitOverrides, ceilings: &ServerLimits) -> Result<ResolvedLimits> {
    let cpu_ms = narrow("cpu_time_ms", overrides.cpu_time_ms, ceilings.max_cpu_time_ms)?;
    let wall_ms = narrow("wall_time_ms", overrides.wall_time_ms, ceilings.max_wall_time_ms)?;
    let memory = narrow("memory_bytes", overrides.memory_bytes, ceilings.max_memory_bytes)?;
    let output = narrow("output_bytes", overrides.output_bytes, ceilings.max_output_bytes)?;

    let output_bytes = usize::try_from(output)
        .map_err(|_| RunboxError::Config(format!("output_bytes {output} does not fit in memory")))?;

    Ok(ResolvedLimits {
        cpu_time: Duration::from_millis(cpu_ms),
        wall_time: Duration::from_millis(wall_ms),
        memory_bytes: memory,
        output_bytes,
        max_processes: ceilings.max_processes,
        file_size_bytes: ceilings.max_file_size_bytes,
    })
}

fn narrow(name: &str, requested: Option<u64>, ceiling: u64) -> Result<u64> {
    match requested {
        None => Ok(ceiling),
        Some(0) => Err(RunboxError::Config(format!("{name} must be greater than zero"))),
        Some(value) if value > ceiling => Err(RunboxError::Config(format!(
            "{name} {value} exceeds server ceiling {ceiling}"
        ))),
        Some(value) => Ok(value),
    }
}

/// Translates execution requests into isolation configs.
pub struct IsolationConfigBuilder<'a> {
    server: &'a ServerConfig,
    runtimes: &'a RuntimeRegistry,
}

impl<'a> IsolationConfigBuilder<'a> {
    pub fn new(server: &'a ServerConfig, runtimes: &'a RuntimeRegistry) -> Self {
        Self { server, runtimes }
    }

    /// Validate a request without allocating anything. Used at admission.
    pub fn check(&self, request: &ExecutionRequest) -> Result<ResolvedLimits> {
        let limits = &self.server.limits;

        if request.source.trim().is_empty() {
            return Err(RunboxError::Config("source is empty".to_string()));
        }
        if request.source.len() > limits.max_source_bytes {
            return Err(RunboxError::Config(format!(
                "source is {} bytes, limit is {}",
                request.source.len(),
                limits.max_source_bytes
            )));
        }
        if request.source.contains('\0') {
            return Err(RunboxError::Config("source contains NUL bytes".to_string()));
        }
        if let Some(stdin) = &request.stdin {
            if stdin.len() > limits.max_stdin_bytes {
                return Err(RunboxError::Config(format!(
                    "stdin is {} bytes, limit is {}",
                    stdin.len(),
                    limits.max_stdin_bytes
                )));
            }
        }

        self.runtimes.resolve(&request.runtime)?;
        resolve_limits(&request.limits, limits)
    }

    /// Derive the full isolation config for an admitted execution.
    pub fn build(&self, execution_id: &ExecutionId, request: &ExecutionRequest) -> Result<IsolationConfig> {
        let limits = self.check(request)?;
        let adapter = self.runtimes.resolve(&request.runtime)?;

        let root = &self.server.scratch_root;
        let scratch = scratch_dir(root, execution_id);
        let scratch_str = scratch.to_string_lossy().into_owned();

        let mut environment = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), scratch_str.clone()),
            ("TMPDIR".to_string(), scratch_str),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        for (key, value) in adapter.environment() {
            environment.retain(|(k, _)| k != &key);
            environment.push((key, value));
        }

        let config = IsolationConfig {
            execution_id: execution_id.clone(),
            runtime: adapter.id().to_string(),
            limits,
            filesystem: FilesystemPolicy {
                read_only_root: true,
                execution_dir: execution_dir(root, execution_id),
                scratch_dir: scratch,
                read_only_binds: self.server.read_only_binds.clone(),
            },
            network: self.server.network,
            seccomp_profile: self.server.seccomp_profile.clone(),
            program: adapter.program(&request.source),
            environment,
            kill_grace: Duration::from_millis(self.server.limits.kill_grace_ms),
            output_drain: Duration::from_millis(self.server.limits.output_drain_ms),
        };

        log::debug!(
            "[{}] built isolation config: runtime={} cpu={:?} wall={:?} mem={} out={}",
            execution_id,
            config.runtime,
            config.limits.cpu_time,
            config.limits.wall_time,
            config.limits.memory_bytes,
            config.limits.output_bytes
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::NetworkPolicy;

    fn server() -> ServerConfig {
        ServerConfig {
            scratch_root: PathBuf::from("/srv/runbox"),
            ..Default::default()
        }
    }

    #[test]
    fn overrides_narrow_ceilings() {
        let ceilings = ServerLimits::default();
        let overrides = LimitOverrides {
            wall_time_ms: Some(500),
            output_bytes: Some(1000),
            ..Default::default()
        };
        let limits = resolve_limits(&overrides, &ceilings).unwrap();
        assert_eq!(limits.wall_time, Duration::from_millis(500));
        assert_eq!(limits.output_bytes, 1000);
        assert_eq!(limits.cpu_time, Duration::from_millis(ceilings.max_cpu_time_ms));
    }

    #[test]
    fn overrides_cannot_widen_or_zero() {
        let ceilings = ServerLimits::default();
        let wider = LimitOverrides {
            memory_bytes: Some(ceilings.max_memory_bytes + 1),
            ..Default::default()
        };
        assert!(matches!(resolve_limits(&wider, &ceilings), Err(RunboxError::Config(_))));

        let zero = LimitOverrides {
            cpu_time_ms: Some(0),
            ..Default::default()
        };
        assert!(matches!(resolve_limits(&zero, &ceilings), Err(RunboxError::Config(_))));
    }

    #[test]
    fn equal_to_ceiling_is_allowed() {
        let ceilings = ServerLimits::default();
        let equal = LimitOverrides {
            wall_time_ms: Some(ceilings.max_wall_time_ms),
            ..Default::default()
        };
        assert!(resolve_limits(&equal, &ceilings).is_ok());
    }

    #[test]
    fn check_rejects_bad_requests() {
        let server = server();
        let runtimes = RuntimeRegistry::with_defaults();
        let builder = IsolationConfigBuilder::new(&server, &runtimes);

        assert!(builder.check(&ExecutionRequest::new("cobol", "x")).is_err());
        assert!(builder.check(&ExecutionRequest::new("sh", "   ")).is_err());

        let huge = "x".repeat(server.limits.max_source_bytes + 1);
        assert!(builder.check(&ExecutionRequest::new("sh", huge)).is_err());

        let stdin = "y".repeat(server.limits.max_stdin_bytes + 1);
        assert!(builder
            .check(&ExecutionRequest::new("sh", "cat").with_stdin(stdin))
            .is_err());
    }

    #[test]
    fn scratch_paths_derive_from_execution_id() {
        let server = server();
        let runtimes = RuntimeRegistry::with_defaults();
        let builder = IsolationConfigBuilder::new(&server, &runtimes);
        let request = ExecutionRequest::new("python", "print(1)");

        let a = builder.build(&ExecutionId::from("a"), &request).unwrap();
        let b = builder.build(&ExecutionId::from("b"), &request).unwrap();

        assert_eq!(a.filesystem.scratch_dir, PathBuf::from("/srv/runbox/a/box"));
        assert_eq!(a.filesystem.execution_dir, PathBuf::from("/srv/runbox/a"));
        assert_ne!(a.filesystem.scratch_dir, b.filesystem.scratch_dir);
        assert!(a.filesystem.read_only_root);
        assert_eq!(a.network, NetworkPolicy::Disabled);
        assert_eq!(a.runtime, "python");
        assert!(a
            .environment
            .iter()
            .any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
        assert!(a
            .environment
            .iter()
            .any(|(k, v)| k == "HOME" && v == "/srv/runbox/a/box"));
    }
}
