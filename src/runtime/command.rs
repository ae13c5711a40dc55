use crate::config::types::{ProgramSpec, Result, RunboxError};
use crate::runtime::adapter::{RuntimeAdapter, SourceDelivery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SOURCE_PLACEHOLDER: &str = "{source}";
const FILE_PLACEHOLDER: &str = "{file}";

/// Runtime entry from the server configuration.
///
/// With only `interpreter` set it overrides the executable of a built-in
/// runtime. With `command` set it defines a new runtime; `{file}` expands to
/// `source_file` and `{source}` to the source text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Runtime defined entirely by configuration
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    id: String,
    command: Vec<String>,
    source_file: Option<String>,
    environment: Vec<(String, String)>,
}

impl CommandRuntime {
    pub fn from_spec(id: &str, spec: &RuntimeSpec) -> Result<Self> {
        let command = spec.command.clone().unwrap_or_default();
        if command.is_empty() {
            return Err(RunboxError::Config(format!(
                "runtime '{id}' needs a non-empty command"
            )));
        }
        match &spec.source_file {
            Some(name) => {
                if name.is_empty() || name.contains('/') || name.starts_with('.') {
                    return Err(RunboxError::Config(format!(
                        "runtime '{id}' source_file must be a plain file name"
                    )));
                }
            }
            None => {
                if !command.iter().any(|arg| arg.contains(SOURCE_PLACEHOLDER)) {
                    return Err(RunboxError::Config(format!(
                        "runtime '{id}' has no source_file and no {SOURCE_PLACEHOLDER} argument"
                    )));
                }
            }
        }

        Ok(Self {
            id: id.to_string(),
            command,
            source_file: spec.source_file.clone(),
            environment: spec
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

impl RuntimeAdapter for CommandRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn interpreter(&self) -> &str {
        &self.command[0]
    }

    fn delivery(&self) -> SourceDelivery {
        match &self.source_file {
            Some(name) => SourceDelivery::File(name.clone()),
            None => SourceDelivery::Argument,
        }
    }

    fn program(&self, source: &str) -> ProgramSpec {
        let file = self.source_file.as_deref().unwrap_or("");
        let argv = self
            .command
            .iter()
            .map(|arg| {
                arg.replace(FILE_PLACEHOLDER, file)
                    .replace(SOURCE_PLACEHOLDER, source)
            })
            .collect();
        ProgramSpec {
            argv,
            source_file: self.source_file.clone(),
        }
    }

    fn environment(&self) -> Vec<(String, String)> {
        self.environment.clone()
    }
}
