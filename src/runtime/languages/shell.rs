use crate::config::types::ProgramSpec;
use crate::runtime::adapter::{RuntimeAdapter, SourceDelivery};

pub const SH_INTERPRETER: &str = "/bin/sh";
pub const BASH_INTERPRETER: &str = "/bin/bash";
const BASH_SOURCE_FILE: &str = "main.sh";

/// POSIX shell; the script is passed inline via `-c`.
#[derive(Debug, Clone)]
pub struct ShAdapter {
    interpreter: String,
}

impl ShAdapter {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for ShAdapter {
    fn default() -> Self {
        Self::new(SH_INTERPRETER)
    }
}

impl RuntimeAdapter for ShAdapter {
    fn id(&self) -> &str {
        "sh"
    }

    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn delivery(&self) -> SourceDelivery {
        SourceDelivery::Argument
    }

    fn program(&self, source: &str) -> ProgramSpec {
        ProgramSpec {
            argv: vec![
                self.interpreter.clone(),
                "-c".to_string(),
                source.to_string(),
            ],
            source_file: None,
        }
    }

    fn hello_source(&self) -> Option<&str> {
        Some("echo ok")
    }
}

/// Bash; the script is written to the scratch dir.
#[derive(Debug, Clone)]
pub struct BashAdapter {
    interpreter: String,
}

impl BashAdapter {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for BashAdapter {
    fn default() -> Self {
        Self::new(BASH_INTERPRETER)
    }
}

impl RuntimeAdapter for BashAdapter {
    fn id(&self) -> &str {
        "bash"
    }

    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn delivery(&self) -> SourceDelivery {
        SourceDelivery::File(BASH_SOURCE_FILE.to_string())
    }

    fn program(&self, _source: &str) -> ProgramSpec {
        ProgramSpec {
            argv: vec![self.interpreter.clone(), BASH_SOURCE_FILE.to_string()],
            source_file: Some(BASH_SOURCE_FILE.to_string()),
        }
    }

    fn hello_source(&self) -> Option<&str> {
        Some("echo ok")
    }
}
