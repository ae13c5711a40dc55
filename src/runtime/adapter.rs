use crate::config::types::ProgramSpec;

/// How the source text reaches the program
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDelivery {
    /// Written to this file name inside the scratch directory
    File(String),
    /// Passed verbatim as a program argument
    Argument,
}

/// Runtime adapter contract.
pub trait RuntimeAdapter: Send + Sync {
    fn id(&self) -> &str;
    /// Executable that must exist for this runtime to work
    fn interpreter(&self) -> &str;
    fn delivery(&self) -> SourceDelivery;
    fn program(&self, source: &str) -> ProgramSpec;

    /// Extra environment for the sandboxed program
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Trivial program that must complete with exit code 0; used by `check-runtimes`
    fn hello_source(&self) -> Option<&str> {
        None
    }
}
