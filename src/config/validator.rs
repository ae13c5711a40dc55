// Server configuration validation
// Fail fast at startup with actionable errors rather than at first request.

use crate::config::server::{EngineConfig, ServerConfig};
use crate::config::types::{Result, RunboxError};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a server configuration. Errors are fatal; warnings are logged.
pub fn validate_server_config(config: &ServerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_engine(config, &mut result);

    for warning in &result.warnings {
        log::warn!("Config warning: {}", warning);
    }

    if !result.is_valid() {
        return Err(RunboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &ServerConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    for (name, value) in [
        ("max_cpu_time_ms", limits.max_cpu_time_ms),
        ("max_wall_time_ms", limits.max_wall_time_ms),
        ("max_memory_bytes", limits.max_memory_bytes),
        ("max_output_bytes", limits.max_output_bytes),
        ("max_file_size_bytes", limits.max_file_size_bytes),
    ] {
        if value == 0 {
            result.add_error(format!("limits.{name} must be greater than zero"));
        }
    }

    if limits.max_concurrent_executions == 0 {
        result.add_error("limits.max_concurrent_executions must be at least 1".to_string());
    }
    if limits.max_processes == 0 {
        result.add_error("limits.max_processes must be at least 1".to_string());
    }
    if limits.max_source_bytes == 0 {
        result.add_error("limits.max_source_bytes must be greater than zero".to_string());
    }

    if limits.max_output_bytes > usize::MAX as u64 {
        result.add_error("limits.max_output_bytes does not fit in memory".to_string());
    }

    if limits.max_cpu_time_ms > limits.max_wall_time_ms {
        result.add_warning(format!(
            "max_cpu_time_ms ({}) exceeds max_wall_time_ms ({}); wall clock will always fire first",
            limits.max_cpu_time_ms, limits.max_wall_time_ms
        ));
    }

    if limits.kill_grace_ms > 10_000 {
        result.add_warning(format!(
            "kill_grace_ms is {}ms; timed-out executions hold a slot that long",
            limits.kill_grace_ms
        ));
    }
}

fn validate_paths(config: &ServerConfig, result: &mut ValidationResult) {
    if !config.scratch_root.is_absolute() {
        result.add_error(format!(
            "scratch_root must be absolute: {}",
            config.scratch_root.display()
        ));
    }

    for bind in &config.read_only_binds {
        if !bind.is_absolute() {
            result.add_error(format!("read_only_binds entry must be absolute: {}", bind.display()));
        } else if !bind.exists() {
            result.add_warning(format!("read_only_binds entry does not exist: {}", bind.display()));
        }
    }
}

fn validate_engine(config: &ServerConfig, result: &mut ValidationResult) {
    match &config.engine {
        EngineConfig::Local { cgroup_root } => {
            result.add_warning(
                "local engine provides no namespace, network or syscall isolation; \
                 do not use it for untrusted code"
                    .to_string(),
            );
            if let Some(root) = cgroup_root {
                if !root.is_absolute() {
                    result.add_error(format!(
                        "engine.cgroup_root must be absolute: {}",
                        root.display()
                    ));
                }
            }
        }
        EngineConfig::External { path, .. } => {
            if !path.is_absolute() {
                result.add_error(format!("engine.path must be absolute: {}", path.display()));
            } else if !path.exists() {
                result.add_error(format!("engine binary not found: {}", path.display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate_server_config(&ServerConfig::default()).unwrap();
        assert!(result.is_valid());
        // The local engine always carries a warning
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn zero_ceilings_are_rejected() {
        let mut config = ServerConfig::default();
        config.limits.max_concurrent_executions = 0;
        config.limits.max_output_bytes = 0;
        let err = validate_server_config(&config).unwrap_err().to_string();
        assert!(err.contains("max_concurrent_executions"));
        assert!(err.contains("max_output_bytes"));
    }

    #[test]
    fn relative_paths_are_rejected() {
        let mut config = ServerConfig::default();
        config.scratch_root = "scratch".into();
        config.engine = EngineConfig::External {
            path: "jail".into(),
            args: Vec::new(),
        };
        let err = validate_server_config(&config).unwrap_err().to_string();
        assert!(err.contains("scratch_root"));
        assert!(err.contains("engine.path"));
    }
}
