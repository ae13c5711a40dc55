use crate::config::server::ServerConfig;
use crate::config::types::{ExecutionId, ExecutionRequest, LimitOverrides, RunboxError};
use crate::core::pool::ExecutionPool;
use crate::core::types::ExecutionOutcome;
use crate::observability::metrics::MetricsSnapshot;
use crate::runtime::RuntimeAdapter;
use crate::verdict::encoder::{EncodedResult, ResultEncoder};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Sandboxed execution supervisor", long_about = None)]
struct Cli {
    /// Server configuration file (JSON). Falls back to $RUNBOX_CONFIG, then ./runbox.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one snippet and print the encoded result
    Execute {
        /// Runtime identifier (python, node, sh, bash or a configured runtime)
        #[arg(long)]
        runtime: String,
        /// Source code as string
        #[arg(long, conflicts_with = "code_file", required_unless_present = "code_file")]
        code: Option<String>,
        /// Read source code from a file
        #[arg(long)]
        code_file: Option<PathBuf>,
        /// Input data to pass to stdin
        #[arg(long)]
        stdin: Option<String>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        cpu_ms: Option<u64>,
        /// Wall clock limit in milliseconds
        #[arg(long)]
        wall_ms: Option<u64>,
        /// Memory limit in bytes
        #[arg(long)]
        memory_bytes: Option<u64>,
        /// Per-stream output cap in bytes
        #[arg(long)]
        output_bytes: Option<u64>,
    },
    /// Serve JSON-lines requests on stdin, one response line per event on stdout
    Serve,
    /// Check that every configured runtime's interpreter is installed
    CheckRuntimes {
        /// Show interpreter versions
        #[arg(long)]
        verbose: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        anyhow::bail!("runbox requires Linux process-group and rlimit semantics");
    }

    let cli = Cli::parse();
    let server = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Execute {
            runtime,
            code,
            code_file,
            stdin,
            cpu_ms,
            wall_ms,
            memory_bytes,
            output_bytes,
        } => {
            let source = match (code, code_file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("either --code or --code-file is required"),
            };
            let mut request = ExecutionRequest::new(runtime, source).with_limits(LimitOverrides {
                cpu_time_ms: cpu_ms,
                wall_time_ms: wall_ms,
                memory_bytes,
                output_bytes,
            });
            request.stdin = stdin;
            execute_once(server, request)
        }
        Commands::Serve => serve(server),
        Commands::CheckRuntimes { verbose } => check_runtimes(server, verbose),
    }
}

fn execute_once(server: ServerConfig, request: ExecutionRequest) -> Result<()> {
    let pool = ExecutionPool::from_config(server)?;
    let result = pool.execute(request)?;
    println!("{}", serde_json::to_string_pretty(&ResultEncoder::encode(&result))?);
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServeRequest {
    Execute {
        /// Opaque client tag echoed in every response for this request
        #[serde(default)]
        tag: Option<String>,
        request: ExecutionRequest,
    },
    Cancel {
        execution_id: ExecutionId,
    },
    Stats,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl From<&RunboxError> for ErrorBody {
    fn from(err: &RunboxError) -> Self {
        let message = match err {
            RunboxError::AdmissionRejected(reason) => reason.to_string(),
            RunboxError::Config(msg) => msg.clone(),
            // Anything else may carry host details
            other => other.code().to_string(),
        };
        Self {
            code: err.code(),
            message,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServeResponse {
    Admitted {
        tag: Option<String>,
        execution_id: String,
    },
    Result {
        tag: Option<String>,
        result: EncodedResult,
    },
    Rejected {
        tag: Option<String>,
        error: ErrorBody,
    },
    Cancel {
        execution_id: String,
        found: bool,
    },
    Stats {
        active: usize,
        capacity: usize,
        metrics: MetricsSnapshot,
    },
    Error {
        message: String,
    },
}

fn serve(server: ServerConfig) -> Result<()> {
    let pool = Arc::new(ExecutionPool::from_config(server)?);
    let (out_tx, out_rx) = unbounded::<ServeResponse>();

    let writer = std::thread::Builder::new()
        .name("runbox-serve-out".to_string())
        .spawn(move || -> std::io::Result<()> {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for response in out_rx {
                let line = serde_json::to_string(&response).map_err(std::io::Error::other)?;
                writeln!(out, "{}", line)?;
                out.flush()?;
            }
            Ok(())
        })?;

    log::info!(
        "Serving JSON lines on stdin (capacity {})",
        pool.capacity()
    );

    let mut workers = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        workers.retain(|w: &std::thread::JoinHandle<()>| !w.is_finished());

        match serde_json::from_str::<ServeRequest>(&line) {
            Ok(request) => {
                if let Some(worker) = handle_request(&pool, request, &out_tx)? {
                    workers.push(worker);
                }
            }
            Err(e) => {
                let _ = out_tx.send(ServeResponse::Error {
                    message: format!("malformed request: {}", e),
                });
            }
        }
    }

    log::info!("stdin closed; waiting for {} in-flight executions", workers.len());
    for worker in workers {
        let _ = worker.join();
    }
    drop(out_tx);
    writer
        .join()
        .map_err(|_| anyhow::anyhow!("output writer panicked"))??;
    Ok(())
}

fn handle_request(
    pool: &Arc<ExecutionPool>,
    request: ServeRequest,
    out: &Sender<ServeResponse>,
) -> Result<Option<std::thread::JoinHandle<()>>> {
    match request {
        ServeRequest::Execute { tag, request } => match pool.admit(request) {
            Ok(admission) => {
                let _ = out.send(ServeResponse::Admitted {
                    tag: tag.clone(),
                    execution_id: admission.execution_id().to_string(),
                });
                let out = out.clone();
                let worker = std::thread::Builder::new()
                    .name(format!("runbox-exec-{}", admission.execution_id()))
                    .spawn(move || {
                        let result = admission.run();
                        let _ = out.send(ServeResponse::Result {
                            tag,
                            result: ResultEncoder::encode(&result),
                        });
                    })?;
                Ok(Some(worker))
            }
            Err(e) => {
                let _ = out.send(ServeResponse::Rejected {
                    tag,
                    error: ErrorBody::from(&e),
                });
                Ok(None)
            }
        },
        ServeRequest::Cancel { execution_id } => {
            let found = pool.cancel(&execution_id);
            let _ = out.send(ServeResponse::Cancel {
                execution_id: execution_id.to_string(),
                found,
            });
            Ok(None)
        }
        ServeRequest::Stats => {
            let _ = out.send(ServeResponse::Stats {
                active: pool.active(),
                capacity: pool.capacity(),
                metrics: pool.metrics(),
            });
            Ok(None)
        }
    }
}

/// Run the adapter's hello program under the configured limits
fn smoke_run(pool: &ExecutionPool, adapter: &dyn RuntimeAdapter) -> std::result::Result<(), String> {
    let Some(source) = adapter.hello_source() else {
        return Ok(());
    };
    let result = pool
        .execute(ExecutionRequest::new(adapter.id(), source))
        .map_err(|e| e.to_string())?;
    match result.outcome {
        ExecutionOutcome::Completed { exit_code: 0 } => Ok(()),
        outcome => {
            let stderr = String::from_utf8_lossy(&result.output.stderr);
            Err(format!(
                "{:?}: {}",
                outcome,
                stderr.lines().next().unwrap_or("").trim()
            ))
        }
    }
}

fn check_runtimes(server: ServerConfig, verbose: bool) -> Result<()> {
    use std::process::Command;

    let pool = ExecutionPool::from_config(server)?;

    println!("🔍 Checking runtime interpreters...");
    println!();

    let mut missing = Vec::new();
    let mut unusable = Vec::new();
    for adapter in pool.runtimes().adapters() {
        let interpreter = adapter.interpreter();
        let version = Command::new(interpreter)
            .arg("--version")
            .env_clear()
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| {
                let text = if output.stdout.is_empty() {
                    output.stderr
                } else {
                    output.stdout
                };
                String::from_utf8_lossy(&text)
                    .lines()
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string()
            });

        let Some(version) = version else {
            println!("❌ {} - MISSING", adapter.id());
            if verbose {
                println!("  {} -> NOT FOUND", interpreter);
            }
            missing.push(adapter.id().to_string());
            continue;
        };

        match smoke_run(&pool, adapter) {
            Ok(()) => {
                println!("✅ {} - OK", adapter.id());
                if verbose {
                    println!("  {} -> {}", interpreter, version);
                }
            }
            Err(reason) => {
                println!("⚠️  {} - UNUSABLE under configured limits", adapter.id());
                if verbose {
                    println!("  {} -> {}", interpreter, reason);
                }
                unusable.push(adapter.id().to_string());
            }
        }
    }

    println!();
    if missing.is_empty() && unusable.is_empty() {
        println!("🎉 All runtimes are installed and usable");
        return Ok(());
    }
    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing runtimes: {}", missing.join(", ")));
    }
    if !unusable.is_empty() {
        problems.push(format!("unusable runtimes: {}", unusable.join(", ")));
    }
    anyhow::bail!("{}", problems.join("; "))
}
