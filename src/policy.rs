//! Path validation for everything the agent touches on disk.
//!
//! Paths are resolved to absolute, symlink-free form before the allow-list
//! check so `../` tricks and symlinks out of an allowed root are caught. The
//! same policy object backs the JSON-RPC file handlers, `run_command`'s cwd
//! and the SFTP subsystem.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("path not in allowed list: {0}")]
    Denied(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct PathPolicy {
    allowed: Option<Vec<PathBuf>>,
}

impl PathPolicy {
    /// An empty or absent allow-list leaves the agent unrestricted.
    #[must_use]
    pub fn new(allowed: Option<Vec<PathBuf>>) -> Self {
        Self {
            allowed: allowed.filter(|paths| !paths.is_empty()),
        }
    }

    #[must_use]
    pub fn unrestricted() -> Self {
        Self { allowed: None }
    }

    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    /// Resolve without the allow-list check. SFTP `realpath` uses this so
    /// clients can still canonicalize denied paths and fail later with a
    /// clear error on the actual operation.
    pub fn resolve_unchecked(&self, path: impl AsRef<Path>) -> Result<PathBuf, PolicyError> {
        Ok(resolve(path.as_ref())?)
    }

    /// Resolve `path` and check it against the allow-list. The resolved path
    /// is returned so callers operate on the canonical form, never the input.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, PolicyError> {
        let resolved = resolve(path.as_ref())?;

        let Some(allowed) = &self.allowed else {
            return Ok(resolved);
        };

        for root in allowed {
            if let Ok(root) = resolve(root) {
                if resolved.starts_with(&root) {
                    return Ok(resolved);
                }
            }
        }

        Err(PolicyError::Denied(
            path.as_ref().to_string_lossy().into_owned(),
        ))
    }
}

/// Resolve to an absolute, symlink-free path without requiring the full path
/// to exist: the deepest existing ancestor is canonicalized and the remaining
/// components are appended lexically. Lets `write_file` target new files
/// while still resolving through any symlinked parents.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    if let Ok(resolved) = absolute.canonicalize() {
        return Ok(resolved);
    }

    let mut existing = absolute.clone();
    let mut tail = Vec::new();

    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_owned());
                existing.pop();
            }
            // Ran out of named components (e.g. "/nonexistent/.."), fall
            // back to lexical normalization from the root.
            None => return Ok(normalize(&absolute)),
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }

    Ok(normalize(&resolved))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            part => out.push(part.as_os_str()),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_permits_everything() {
        let policy = PathPolicy::unrestricted();

        assert!(policy.resolve("/etc/passwd").is_ok());
        assert!(!policy.is_restricted());
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        let policy = PathPolicy::new(Some(vec![]));

        assert!(policy.resolve("/etc/passwd").is_ok());
        assert!(!policy.is_restricted());
    }

    #[test]
    fn path_inside_allowed_root_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("notes.txt");
        std::fs::write(&inside, b"ok").unwrap();

        let policy = PathPolicy::new(Some(vec![dir.path().to_path_buf()]));

        let resolved = policy.resolve(&inside).unwrap();
        assert!(resolved.ends_with("notes.txt"));
    }

    #[test]
    fn allowed_root_itself_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::new(Some(vec![dir.path().to_path_buf()]));

        assert!(policy.resolve(dir.path()).is_ok());
    }

    #[test]
    fn path_outside_allowed_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::new(Some(vec![dir.path().to_path_buf()]));

        let err = policy.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, PolicyError::Denied(_)));
    }

    #[test]
    fn parent_traversal_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::new(Some(vec![dir.path().to_path_buf()]));

        let sneaky = dir.path().join("../../etc/passwd");
        assert!(policy.resolve(&sneaky).is_err());
    }

    #[test]
    fn nonexistent_target_under_allowed_root_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::new(Some(vec![dir.path().to_path_buf()]));

        let target = dir.path().join("new/sub/file.bin");
        let resolved = policy.resolve(&target).unwrap();

        assert!(resolved.ends_with("new/sub/file.bin"));
    }
}
