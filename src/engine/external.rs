//! External isolation engine driven over a command line and a report file.
//!
//! The engine runs the payload inside its own namespaces/cgroups, proxies
//! stdio, and writes `key:value` lines to the report file before exiting.

use crate::config::types::{IsolationConfig, NetworkPolicy, Result};
use crate::core::types::{ResourceKind, UsageStats};
use crate::engine::{configured_controls, EngineReport, IsolationEngine};
use crate::kernel::process::{ExitEvidence, ReapStatus};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Parsed engine report file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportFile {
    pub status: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub oom_killed: bool,
    pub cpu_exceeded: bool,
    pub pids_exceeded: bool,
    pub fsize_exceeded: bool,
    pub message: Option<String>,
    pub cpu_time_ms: Option<u64>,
    pub max_rss_bytes: Option<u64>,
}

impl ReportFile {
    /// Parse `key:value` lines. Unknown keys and malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut report = ReportFile::default();

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "status" => report.status = Some(value.to_string()),
                "exitcode" => report.exit_code = value.parse().ok(),
                "exitsig" => report.exit_signal = value.parse().ok(),
                "oom-killed" => report.oom_killed = flag(value),
                "cpu-exceeded" => report.cpu_exceeded = flag(value),
                "pids-exceeded" => report.pids_exceeded = flag(value),
                "fsize-exceeded" => report.fsize_exceeded = flag(value),
                "message" => report.message = Some(value.to_string()),
                // seconds, e.g. "time:0.412"
                "time" => {
                    report.cpu_time_ms = value
                        .parse::<f64>()
                        .ok()
                        .filter(|secs| *secs >= 0.0)
                        .map(|secs| (secs * 1000.0).round() as u64)
                }
                // kilobytes
                "max-rss" => report.max_rss_bytes = value.parse::<u64>().ok().map(|kb| kb * 1024),
                _ => {}
            }
        }

        report
    }

    pub fn is_setup_failure(&self) -> bool {
        self.status.as_deref() == Some("XX")
    }

    pub fn violation(&self) -> Option<ResourceKind> {
        if self.oom_killed {
            Some(ResourceKind::Memory)
        } else if self.cpu_exceeded {
            Some(ResourceKind::CpuTime)
        } else if self.pids_exceeded {
            Some(ResourceKind::Processes)
        } else if self.fsize_exceeded {
            Some(ResourceKind::FileSize)
        } else {
            None
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

/// Engine binary invoked per execution
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    path: PathBuf,
    args: Vec<String>,
}

impl ExternalEngine {
    pub fn new(path: PathBuf, args: Vec<String>) -> Self {
        Self { path, args }
    }

    /// Engine arguments for one execution, up to and including `--`
    pub fn engine_args(&self, config: &IsolationConfig, report_path: &Path) -> Vec<String> {
        let limits = &config.limits;
        let mut args = self.args.clone();
        args.push(format!("--report={}", report_path.display()));
        args.push(format!("--workdir={}", config.filesystem.scratch_dir.display()));
        args.push(format!("--cpu-ms={}", limits.cpu_time.as_millis()));
        args.push(format!("--wall-ms={}", limits.wall_time.as_millis()));
        args.push(format!("--memory-bytes={}", limits.memory_bytes));
        args.push(format!("--max-processes={}", limits.max_processes));
        args.push(format!("--file-size-bytes={}", limits.file_size_bytes));
        args.push(format!("--seccomp-profile={}", config.seccomp_profile));
        if config.filesystem.read_only_root {
            args.push("--ro-root".to_string());
        }
        if config.network == NetworkPolicy::Host {
            args.push("--share-net".to_string());
        }
        for bind in &config.filesystem.read_only_binds {
            args.push(format!("--bind-ro={}", bind.display()));
        }
        for (key, value) in &config.environment {
            args.push(format!("--env={}={}", key, value));
        }
        args.push("--".to_string());
        args
    }
}

impl IsolationEngine for ExternalEngine {
    fn name(&self) -> &str {
        "external"
    }

    fn command(&self, config: &IsolationConfig, report_path: &Path) -> Result<Command> {
        let mut cmd = Command::new(&self.path);
        cmd.args(self.engine_args(config, report_path))
            .args(&config.program.argv)
            .env_clear()
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .current_dir(&config.filesystem.scratch_dir);
        Ok(cmd)
    }

    fn interpret(
        &self,
        _config: &IsolationConfig,
        report_path: &Path,
        status: &ReapStatus,
    ) -> EngineReport {
        let mut report = EngineReport::from_reap(status);

        let content = match std::fs::read_to_string(report_path) {
            Ok(content) => content,
            Err(e) => {
                // A killed engine may not get to write its report; that is not a setup failure.
                if let ExitEvidence::Exited(code) = status.exit {
                    report.setup_failure = Some(format!(
                        "engine exited with code {} without a readable report: {}",
                        code, e
                    ));
                }
                return report;
            }
        };

        let file = ReportFile::parse(&content);
        if file.is_setup_failure() {
            report.setup_failure = Some(
                file.message
                    .clone()
                    .unwrap_or_else(|| "engine reported setup failure".to_string()),
            );
            return report;
        }

        report.exit = match (file.exit_signal, file.exit_code) {
            (Some(sig), _) => ExitEvidence::Signaled(sig),
            (None, Some(code)) => ExitEvidence::Exited(code),
            (None, None) => status.exit,
        };
        report.violation = file.violation();
        report.engine_timed_out = file.status.as_deref() == Some("TO");
        report.usage = UsageStats {
            cpu_time_ms: file.cpu_time_ms.unwrap_or(status.cpu_time_ms),
            peak_memory_bytes: file.max_rss_bytes.unwrap_or(status.max_rss_bytes),
        };
        report
    }

    fn applied_controls(&self, config: &IsolationConfig) -> Vec<&'static str> {
        configured_controls(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builder::IsolationConfigBuilder;
    use crate::config::server::ServerConfig;
    use crate::config::types::{ExecutionId, ExecutionRequest};
    use crate::engine::missing_controls;
    use crate::runtime::RuntimeRegistry;

    fn config() -> IsolationConfig {
        let server = ServerConfig {
            scratch_root: PathBuf::from("/srv/runbox"),
            ..Default::default()
        };
        let runtimes = RuntimeRegistry::with_defaults();
        IsolationConfigBuilder::new(&server, &runtimes)
            .build(&ExecutionId::from("ext"), &ExecutionRequest::new("python", "print(1)"))
            .unwrap()
    }

    fn reaped(exit: ExitEvidence) -> ReapStatus {
        ReapStatus {
            exit,
            cpu_time_ms: 1,
            max_rss_bytes: 0,
        }
    }

    #[test]
    fn parses_report_lines() {
        let file = ReportFile::parse(
            "status:SG\nexitsig:9\noom-killed:1\ntime:0.250\nmax-rss:2048\nmessage:Caught fatal signal 9\ngarbage\n",
        );
        assert_eq!(file.status.as_deref(), Some("SG"));
        assert_eq!(file.exit_signal, Some(9));
        assert_eq!(file.violation(), Some(ResourceKind::Memory));
        assert_eq!(file.cpu_time_ms, Some(250));
        assert_eq!(file.max_rss_bytes, Some(2048 * 1024));
        assert_eq!(file.message.as_deref(), Some("Caught fatal signal 9"));
    }

    #[test]
    fn args_carry_limits_and_policy() {
        let cfg = config();
        let engine = ExternalEngine::new("/usr/bin/jail".into(), vec!["--quiet".into()]);
        let args = engine.engine_args(&cfg, Path::new("/srv/runbox/ext/engine.report"));

        assert_eq!(args.first().map(String::as_str), Some("--quiet"));
        assert!(args.contains(&"--report=/srv/runbox/ext/engine.report".to_string()));
        assert!(args.contains(&"--workdir=/srv/runbox/ext/box".to_string()));
        assert!(args.contains(&"--ro-root".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
        assert!(args.contains(&"--env=PYTHONUNBUFFERED=1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--"));
        assert!(missing_controls(&engine, &cfg).is_empty());
    }

    #[test]
    fn interprets_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.report");
        let engine = ExternalEngine::new("/usr/bin/jail".into(), Vec::new());
        let cfg = config();

        std::fs::write(&path, "status:RE\nexitcode:3\n").unwrap();
        let report = engine.interpret(&cfg, &path, &reaped(ExitEvidence::Exited(1)));
        assert_eq!(report.exit, ExitEvidence::Exited(3));
        assert_eq!(report.violation, None);
        assert!(report.setup_failure.is_none());

        std::fs::write(&path, "status:XX\nmessage:cannot mount proc\n").unwrap();
        let report = engine.interpret(&cfg, &path, &reaped(ExitEvidence::Exited(2)));
        assert_eq!(report.setup_failure.as_deref(), Some("cannot mount proc"));

        std::fs::write(&path, "status:TO\nexitsig:9\n").unwrap();
        let report = engine.interpret(&cfg, &path, &reaped(ExitEvidence::Exited(1)));
        assert!(report.engine_timed_out);
        assert_eq!(report.exit, ExitEvidence::Signaled(9));
    }

    #[test]
    fn missing_report_depends_on_engine_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.report");
        let engine = ExternalEngine::new("/usr/bin/jail".into(), Vec::new());
        let cfg = config();

        let exited = engine.interpret(&cfg, &path, &reaped(ExitEvidence::Exited(1)));
        assert!(exited.setup_failure.is_some());

        let killed = engine.interpret(&cfg, &path, &reaped(ExitEvidence::Signaled(libc::SIGKILL)));
        assert!(killed.setup_failure.is_none());
        assert_eq!(killed.exit, ExitEvidence::Signaled(libc::SIGKILL));
    }
}
