use crate::config::types::ProgramSpec;
use crate::runtime::adapter::{RuntimeAdapter, SourceDelivery};

pub const DEFAULT_INTERPRETER: &str = "/usr/bin/node";
const SOURCE_FILE: &str = "main.js";

#[derive(Debug, Clone)]
pub struct NodeAdapter {
    interpreter: String,
}

impl NodeAdapter {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for NodeAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER)
    }
}

impl RuntimeAdapter for NodeAdapter {
    fn id(&self) -> &str {
        "node"
    }

    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn delivery(&self) -> SourceDelivery {
        SourceDelivery::File(SOURCE_FILE.to_string())
    }

    fn program(&self, _source: &str) -> ProgramSpec {
        ProgramSpec {
            argv: vec![self.interpreter.clone(), SOURCE_FILE.to_string()],
            source_file: Some(SOURCE_FILE.to_string()),
        }
    }

    fn hello_source(&self) -> Option<&str> {
        Some("console.log('ok')")
    }
}
