use crate::config::types::ProgramSpec;
use crate::runtime::adapter::{RuntimeAdapter, SourceDelivery};

pub const DEFAULT_INTERPRETER: &str = "/usr/bin/python3";
const SOURCE_FILE: &str = "main.py";

#[derive(Debug, Clone)]
pub struct PythonAdapter {
    interpreter: String,
}

impl PythonAdapter {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for PythonAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER)
    }
}

impl RuntimeAdapter for PythonAdapter {
    fn id(&self) -> &str {
        "python"
    }

    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn delivery(&self) -> SourceDelivery {
        SourceDelivery::File(SOURCE_FILE.to_string())
    }

    fn program(&self, _source: &str) -> ProgramSpec {
        ProgramSpec {
            // -B: no .pyc in scratch, -S: skip site-packages discovery
            argv: vec![
                self.interpreter.clone(),
                "-B".to_string(),
                "-S".to_string(),
                SOURCE_FILE.to_string(),
            ],
            source_file: Some(SOURCE_FILE.to_string()),
        }
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]
    }

    fn hello_source(&self) -> Option<&str> {
        Some("print('ok')")
    }
}
