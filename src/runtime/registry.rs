use crate::config::types::{Result, RunboxError};
use crate::runtime::adapter::RuntimeAdapter;
use crate::runtime::command::{CommandRuntime, RuntimeSpec};
use crate::runtime::languages::{
    javascript::NodeAdapter,
    python::PythonAdapter,
    shell::{BashAdapter, ShAdapter},
};
use std::collections::BTreeMap;

/// Resolves runtime identifiers (and their aliases) to adapters.
pub struct RuntimeRegistry {
    adapters: BTreeMap<String, Box<dyn RuntimeAdapter>>,
}

fn canonical_id(runtime: &str) -> &str {
    match runtime {
        "python3" | "py" => "python",
        "javascript" | "js" => "node",
        "shell" => "sh",
        other => other,
    }
}

impl RuntimeRegistry {
    /// Built-in runtimes with default interpreter paths
    pub fn with_defaults() -> Self {
        let mut adapters: BTreeMap<String, Box<dyn RuntimeAdapter>> = BTreeMap::new();
        adapters.insert("python".into(), Box::new(PythonAdapter::default()));
        adapters.insert("node".into(), Box::new(NodeAdapter::default()));
        adapters.insert("sh".into(), Box::new(ShAdapter::default()));
        adapters.insert("bash".into(), Box::new(BashAdapter::default()));
        Self { adapters }
    }

    /// Built-ins plus configured overrides and custom runtimes
    pub fn from_specs(specs: &BTreeMap<String, RuntimeSpec>) -> Result<Self> {
        let mut registry = Self::with_defaults();
        for (id, spec) in specs {
            let adapter: Box<dyn RuntimeAdapter> = if spec.command.is_some() {
                Box::new(CommandRuntime::from_spec(id, spec)?)
            } else {
                let interpreter = spec.interpreter.clone().ok_or_else(|| {
                    RunboxError::Config(format!(
                        "runtime '{id}' needs either an interpreter or a command"
                    ))
                })?;
                match canonical_id(id) {
                    "python" => Box::new(PythonAdapter::new(interpreter)),
                    "node" => Box::new(NodeAdapter::new(interpreter)),
                    "sh" => Box::new(ShAdapter::new(interpreter)),
                    "bash" => Box::new(BashAdapter::new(interpreter)),
                    _ => {
                        return Err(RunboxError::Config(format!(
                            "runtime '{id}' is not built in; define a command for it"
                        )))
                    }
                }
            };
            log::debug!("Registered runtime '{}' ({})", id, adapter.interpreter());
            registry
                .adapters
                .insert(canonical_id(id).to_string(), adapter);
        }
        Ok(registry)
    }

    pub fn get(&self, runtime: &str) -> Option<&dyn RuntimeAdapter> {
        self.adapters.get(canonical_id(runtime)).map(|a| a.as_ref())
    }

    pub fn resolve(&self, runtime: &str) -> Result<&dyn RuntimeAdapter> {
        self.get(runtime).ok_or_else(|| {
            RunboxError::Config(format!("unsupported runtime: {runtime}"))
        })
    }

    pub fn adapters(&self) -> impl Iterator<Item = &dyn RuntimeAdapter> {
        self.adapters.values().map(|a| a.as_ref())
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
