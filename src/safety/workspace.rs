/// Execution-scoped scratch directories
///
/// Layout: `<scratch_root>/<execution_id>/` holds the engine report and
/// `box/`, the only directory the sandboxed program may write.
use crate::config::types::{FilesystemPolicy, Result, RunboxError};
use crate::safety::safe_cleanup;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const REPORT_FILE: &str = "engine.report";

/// Scratch directory owned by one execution. Removed on cleanup or drop.
#[derive(Debug)]
pub struct ExecutionWorkspace {
    execution_dir: PathBuf,
    scratch_dir: PathBuf,
    cleaned: bool,
}

impl ExecutionWorkspace {
    /// Create the execution and scratch directories. Fails if either already exists.
    pub fn create(policy: &FilesystemPolicy) -> Result<Self> {
        if let Some(root) = policy.execution_dir.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(root)
                .map_err(|e| {
                    RunboxError::Workspace(format!(
                        "Failed to create scratch root {}: {}",
                        root.display(),
                        e
                    ))
                })?;
        }

        create_private_dir(&policy.execution_dir)?;
        let workspace = Self {
            execution_dir: policy.execution_dir.clone(),
            scratch_dir: policy.scratch_dir.clone(),
            cleaned: false,
        };
        // From here on, drop removes the execution dir
        create_private_dir(&workspace.scratch_dir)?;
        Ok(workspace)
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Engine report path; outside the scratch dir so the program cannot forge it
    pub fn report_path(&self) -> PathBuf {
        self.execution_dir.join(REPORT_FILE)
    }

    /// Write the program source into the scratch directory
    pub fn write_source(&self, file_name: &str, content: &[u8]) -> Result<PathBuf> {
        if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
            return Err(RunboxError::Workspace(format!(
                "Refusing to write source to '{}'",
                file_name
            )));
        }

        let path = self.scratch_dir.join(file_name);
        fs::write(&path, content).map_err(|e| {
            RunboxError::Workspace(format!("Failed to write source file {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Remove the whole execution directory (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.execution_dir)?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for ExecutionWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!(
                "Failed to remove workspace {}: {}",
                self.execution_dir.display(),
                e
            );
        }
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    DirBuilder::new().mode(0o700).create(dir).map_err(|e| {
        RunboxError::Workspace(format!(
            "Failed to create workspace directory {}: {}",
            dir.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(root: &Path, id: &str) -> FilesystemPolicy {
        FilesystemPolicy {
            read_only_root: true,
            execution_dir: root.join(id),
            scratch_dir: root.join(id).join("box"),
            read_only_binds: Vec::new(),
        }
    }

    #[test]
    fn create_write_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = ExecutionWorkspace::create(&policy(root.path(), "exec-1")).unwrap();
        assert!(workspace.scratch_dir().is_dir());

        let source = workspace.write_source("main.py", b"print(1)").unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"print(1)");
        assert!(!workspace.report_path().starts_with(workspace.scratch_dir()));

        workspace.cleanup().unwrap();
        assert!(!root.path().join("exec-1").exists());
        workspace.cleanup().unwrap();
    }

    #[test]
    fn existing_directory_is_not_reused() {
        let root = tempfile::tempdir().unwrap();
        let _first = ExecutionWorkspace::create(&policy(root.path(), "dup")).unwrap();
        assert!(ExecutionWorkspace::create(&policy(root.path(), "dup")).is_err());
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        {
            let _workspace = ExecutionWorkspace::create(&policy(root.path(), "gone")).unwrap();
            assert!(root.path().join("gone/box").exists());
        }
        assert!(!root.path().join("gone").exists());
    }

    #[test]
    fn source_names_stay_inside_scratch() {
        let root = tempfile::tempdir().unwrap();
        let workspace = ExecutionWorkspace::create(&policy(root.path(), "names")).unwrap();
        assert!(workspace.write_source("../escape", b"x").is_err());
        assert!(workspace.write_source(".hidden", b"x").is_err());
    }
}
