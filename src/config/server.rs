/// Server configuration loading from runbox.json
use crate::config::types::{NetworkPolicy, Result, RunboxError, ServerLimits};
use crate::runtime::command::RuntimeSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "RUNBOX_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "runbox.json";

/// Which isolation engine runs the payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// In-process rlimit and cgroup engine (development; no namespaces)
    Local {
        /// cgroup v2 delegation root; defaults to /sys/fs/cgroup/runbox
        #[serde(default)]
        cgroup_root: Option<PathBuf>,
    },
    /// External engine binary speaking the report-file protocol
    External {
        path: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Local { cgroup_root: None }
    }
}

/// Full runbox.json structure
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub limits: ServerLimits,
    pub engine: EngineConfig,
    /// Parent of every execution directory
    pub scratch_root: PathBuf,
    pub seccomp_profile: String,
    pub network: NetworkPolicy,
    pub read_only_binds: Vec<PathBuf>,
    pub runtimes: BTreeMap<String, RuntimeSpec>,
}

impl ServerConfig {
    /// Scratch root scoped by effective UID so root and non-root runs never share it.
    pub fn default_scratch_root() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("runbox-uid-{}", euid))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ServerConfig = serde_json::from_str(&content)
            .map_err(|e| RunboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration: explicit path, then $RUNBOX_CONFIG, then ./runbox.json, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from_file(PathBuf::from(path));
        }

        let local = std::env::current_dir()
            .map_err(|e| RunboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_file(local);
        }

        log::info!("No configuration file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Reject unusable configurations; warnings are only logged.
    pub fn validate(&self) -> Result<()> {
        crate::config::validator::validate_server_config(self).map(|_| ())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: ServerLimits::default(),
            engine: EngineConfig::default(),
            scratch_root: Self::default_scratch_root(),
            seccomp_profile: "default".to_string(),
            network: NetworkPolicy::Disabled,
            read_only_binds: Vec::new(),
            runtimes: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "limits": {{"max_concurrent_executions": 2, "max_output_bytes": 4096}},
                "engine": {{"kind": "external", "path": "/usr/local/bin/jail", "args": ["--quiet"]}},
                "runtimes": {{"ruby": {{"command": ["/usr/bin/ruby", "{{file}}"], "source_file": "main.rb"}}}}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.limits.max_concurrent_executions, 2);
        assert_eq!(config.limits.max_output_bytes, 4096);
        assert_eq!(config.limits.max_wall_time_ms, ServerLimits::default().max_wall_time_ms);
        assert_eq!(
            config.engine,
            EngineConfig::External {
                path: PathBuf::from("/usr/local/bin/jail"),
                args: vec!["--quiet".to_string()],
            }
        );
        assert_eq!(config.network, NetworkPolicy::Disabled);
        assert!(config.runtimes.contains_key("ruby"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/runbox.json"))).unwrap_err();
        assert!(matches!(err, RunboxError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ServerConfig::load_from_file(file.path()),
            Err(RunboxError::Config(_))
        ));
    }

    #[test]
    fn default_engine_is_local() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.engine, EngineConfig::Local { cgroup_root: None });
        assert_eq!(config.seccomp_profile, "default");
    }

    #[test]
    fn local_engine_accepts_a_cgroup_root() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"engine": {"kind": "local", "cgroup_root": "/sys/fs/cgroup/judge"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.engine,
            EngineConfig::Local {
                cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/judge"))
            }
        );

        let bare: ServerConfig = serde_json::from_str(r#"{"engine": {"kind": "local"}}"#).unwrap();
        assert_eq!(bare.engine, EngineConfig::default());
    }
}
