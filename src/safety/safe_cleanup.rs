use crate::config::types::{Result, RunboxError};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

fn workspace_err(action: &str, path: &Path, err: std::io::Error) -> RunboxError {
    RunboxError::Workspace(format!("{} failed for {}: {}", action, path.display(), err))
}

fn remove_dir_contents(dir: &Path, root_dev: u64) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| workspace_err("read_dir", dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| workspace_err("read_dir entry", dir, e))?;
        let path = entry.path();
        // lstat: a symlink is removed as a link, never followed
        let meta = fs::symlink_metadata(&path).map_err(|e| workspace_err("lstat", &path, e))?;

        if meta.file_type().is_dir() {
            if meta.dev() != root_dev {
                return Err(RunboxError::Workspace(format!(
                    "Refusing to cross filesystem boundary at {}",
                    path.display()
                )));
            }
            // The program may have made its own directories unreadable
            if meta.mode() & 0o700 != 0o700 {
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o700));
            }
            remove_dir_contents(&path, root_dev)?;
            fs::remove_dir(&path).map_err(|e| workspace_err("rmdir", &path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| workspace_err("unlink", &path, e))?;
        }
    }

    Ok(())
}

/// Remove a tree written by sandboxed code without following symlinks or
/// descending into other mounts. Missing paths are not an error.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(workspace_err("lstat", path, e)),
    };

    if !meta.file_type().is_dir() {
        return fs::remove_file(path).map_err(|e| workspace_err("unlink", path, e));
    }

    remove_dir_contents(path, meta.dev())?;
    fs::remove_dir(path).map_err(|e| workspace_err("rmdir", path, e))
}
