//! Per-invocation working directories.
//!
//! Every invocation gets `root/<task_name>/<invocation_id>/`. The directory is
//! created before the task body starts and is never handed to a second node
//! during a run.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::WorkspaceError;
use crate::handle::NodeId;

/// Name of the engine's private area under the workspace root. Task names
/// cannot start with a dot, so it never collides with a task directory.
pub(crate) const ENGINE_DIR: &str = ".pipewright";

#[derive(Debug)]
pub struct WorkspaceAllocator {
    root: Utf8PathBuf,
    allocated: Mutex<HashMap<Utf8PathBuf, NodeId>>,
}

impl WorkspaceAllocator {
    /// Prepare an allocator rooted at `root`, creating the root if needed.
    /// Relative roots are resolved against the current directory.
    pub fn new(root: impl AsRef<Utf8Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            let cwd = std::env::current_dir().map_err(|source| WorkspaceError::Io {
                path: root.to_path_buf(),
                source,
            })?;
            Utf8PathBuf::from_path_buf(cwd)
                .map_err(|path| WorkspaceError::Root(path.display().to_string()))?
                .join(root)
        };

        fs::create_dir_all(&root).map_err(|source| WorkspaceError::Io {
            path: root.clone(),
            source,
        })?;

        Ok(Self {
            root,
            allocated: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The path `node` would get, without creating anything.
    pub fn path_for(&self, node: &NodeId) -> Utf8PathBuf {
        self.root.join(node.task()).join(node.invocation())
    }

    /// Create the workspace of `node` and return its absolute path.
    ///
    /// An existing empty directory is accepted, an existing directory with
    /// content is a conflict. Asking twice for the same node is fine, asking
    /// for a path already owned by another node is not.
    pub fn allocate(&self, node: &NodeId) -> Result<Utf8PathBuf, WorkspaceError> {
        let path = self.path_for(node);

        let mut allocated = self
            .allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(owner) = allocated.get(&path) {
            if owner == node {
                return Ok(path);
            }
            return Err(WorkspaceError::Reused {
                path,
                owner: owner.clone(),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !is_empty_dir(&path)? {
                    return Err(WorkspaceError::Conflict(path));
                }
            }
            Err(source) => return Err(WorkspaceError::Io { path, source }),
        }

        tracing::trace!(node = %node, path = %path, "allocated workspace");
        allocated.insert(path.clone(), node.clone());
        Ok(path)
    }

    /// Private scratch directory of the engine.
    pub(crate) fn engine_dir(&self) -> Result<Utf8PathBuf, WorkspaceError> {
        let path = self.root.join(ENGINE_DIR);
        fs::create_dir_all(&path).map_err(|source| WorkspaceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Remove the whole workspace root.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                tracing::info!(root = %self.root, "removed workspace root");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Io {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

fn is_empty_dir(path: &Utf8Path) -> Result<bool, WorkspaceError> {
    let metadata = fs::metadata(path).map_err(|source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Ok(false);
    }

    let mut entries = fs::read_dir(path).map_err(|source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(entries.next().is_none())
}

/// Symlink the existing paths among `inputs` into `workspace`, as
/// `input_<param>[_<i>]_<basename>`. Non-path values are skipped.
#[cfg(unix)]
pub(crate) fn link_inputs(workspace: &Utf8Path, inputs: &crate::task::Inputs) {
    use serde_json::Value;

    fn link(workspace: &Utf8Path, prefix: &str, source: &str) {
        let source = Utf8Path::new(source);
        if !source.is_absolute() || fs::symlink_metadata(source).is_err() {
            return;
        }
        if source.starts_with(workspace) {
            return;
        }

        let basename = source.file_name().unwrap_or("source");
        let safe: String = basename
            .chars()
            .map(|c| match c {
                c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
                _ => '_',
            })
            .collect();
        let target = workspace.join(format!("{prefix}_{safe}"));

        // The workspace starts empty, so an existing entry is another input.
        if fs::symlink_metadata(&target).is_ok() {
            tracing::warn!(source = %source, target = %target, "input link name already taken, skipping");
            return;
        }
        if let Err(err) = std::os::unix::fs::symlink(source, &target) {
            tracing::warn!(source = %source, target = %target, error = %err, "failed to link input");
        }
    }

    for (name, value) in inputs.iter() {
        match value {
            Value::String(path) => link(workspace, &format!("input_{name}"), path),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if let Value::String(path) = item {
                        link(workspace, &format!("input_{name}_{i}"), path);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn link_inputs(_: &Utf8Path, _: &crate::task::Inputs) {
    tracing::debug!("input linking is only supported on unix");
}
