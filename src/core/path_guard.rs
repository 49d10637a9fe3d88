use std::path::{Component, Path, PathBuf};

use super::error::JobError;

/// Resolves user-supplied backup names against the backup root and refuses
/// anything that would land outside it.
///
/// Resolution never mutates the filesystem. Existing paths are canonicalized
/// (so symlinks are followed before the containment check); missing paths are
/// normalized lexically so a later existence check can report `NotFound`.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: &Path) -> Result<Self, JobError> {
        let root = root.canonicalize().map_err(|e| {
            JobError::NotFound(format!(
                "Backup directory unavailable: {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, JobError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(JobError::InvalidSelection("empty backup name".into()));
        }

        let candidate = normalize(&self.root.join(trimmed));
        let resolved = if candidate.exists() {
            candidate.canonicalize()?
        } else {
            candidate
        };

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(JobError::InvalidSelection(name.to_string()));
        }

        Ok(resolved)
    }
}

/// Lexical `..`/`.` folding; does not touch the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
