use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::errors::{UnsubError, UnsubResult};

pub const NOT_FOUND_PAGE: &str = "404.html";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("path escapes the asset root: {0}")]
    Escape(String),

    #[error("no such asset: {0}")]
    Missing(String),
}

/// Read-only directory a simulation serves from. Every lookup is normalized
/// and must stay under the canonical root.
#[derive(Debug, Clone)]
pub struct AssetRoot {
    root: PathBuf,
}

impl AssetRoot {
    pub fn new(dir: &Path) -> UnsubResult<Self> {
        let root = dir.canonicalize().map_err(|e| {
            UnsubError::Simulation(format!("asset dir {} unusable: {e}", dir.display()))
        })?;
        if !root.is_dir() {
            return Err(UnsubError::Simulation(format!(
                "asset dir {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Maps a root-relative request path to a file. `..` may climb out of a
    /// subdirectory but never out of the root; symlinks are followed and
    /// re-checked. Directories resolve to their `index.html`.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, RouteError> {
        let mut parts: Vec<&str> = Vec::new();
        for segment in rel.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(RouteError::Escape(rel.to_string()));
                    }
                }
                other => parts.push(other),
            }
        }

        let mut path = self.root.clone();
        path.extend(&parts);
        if path.is_dir() {
            path.push("index.html");
        }

        let canonical = path
            .canonicalize()
            .map_err(|_| RouteError::Missing(rel.to_string()))?;
        if !canonical.starts_with(&self.root) {
            return Err(RouteError::Escape(rel.to_string()));
        }
        if !canonical.is_file() {
            return Err(RouteError::Missing(rel.to_string()));
        }
        Ok(canonical)
    }

    pub fn not_found_page(&self) -> Option<PathBuf> {
        self.resolve(NOT_FOUND_PAGE).ok()
    }
}
