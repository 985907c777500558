//! Typed path helpers for array-task artifacts.
//!
//! Every task execution owns an output prefix. Subtask `i` writes under
//! `{prefix}/{i}`, and both the parent and each subtask use the same two
//! well-known document names beneath their prefix.

use crate::error::{Error, Result};

/// Name of the outputs document under an output prefix.
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Name of the error document under an output prefix.
pub const ERROR_FILE: &str = "error.json";

/// Output locations for one task execution (parent or subtask).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputPaths {
    prefix: String,
}

impl OutputPaths {
    /// Creates paths rooted at `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `prefix` is empty or contains
    /// traversal segments, backslashes, or control characters.
    pub fn new(prefix: impl AsRef<str>) -> Result<Self> {
        let prefix = normalize_relative_path(prefix.as_ref())?;
        Ok(Self { prefix })
    }

    /// Returns the output prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the path of the outputs document.
    #[must_use]
    pub fn outputs_path(&self) -> String {
        format!("{}/{OUTPUTS_FILE}", self.prefix)
    }

    /// Returns the path of the error document.
    #[must_use]
    pub fn error_path(&self) -> String {
        format!("{}/{ERROR_FILE}", self.prefix)
    }

    /// Returns the output paths of the subtask at `index`.
    #[must_use]
    pub fn subtask(&self, index: usize) -> Self {
        Self {
            prefix: format!("{}/{index}", self.prefix),
        }
    }
}

impl std::fmt::Display for OutputPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix)
    }
}

fn normalize_relative_path(path: &str) -> Result<String> {
    let normalized = path.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(Error::Validation {
            message: "path must not be empty".to_string(),
        });
    }

    if normalized.contains('\\') {
        return Err(Error::Validation {
            message: "backslashes are not allowed in paths".to_string(),
        });
    }

    if normalized.contains('\n') || normalized.contains('\r') || normalized.contains('\0') {
        return Err(Error::Validation {
            message: "control characters are not allowed in paths".to_string(),
        });
    }

    let path_part = normalized
        .split_once("://")
        .map_or(normalized.as_str(), |(_, rest)| rest);
    for segment in path_part.split('/') {
        if segment == "." || segment == ".." {
            return Err(Error::Validation {
                message: "path traversal is not allowed".to_string(),
            });
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_paths_nest_under_parent() -> Result<()> {
        let parent = OutputPaths::new("s3://bucket/exec-1/")?;
        assert_eq!(parent.prefix(), "s3://bucket/exec-1");
        assert_eq!(parent.outputs_path(), "s3://bucket/exec-1/outputs.json");

        let child = parent.subtask(3);
        assert_eq!(child.prefix(), "s3://bucket/exec-1/3");
        assert_eq!(child.error_path(), "s3://bucket/exec-1/3/error.json");
        Ok(())
    }

    #[test]
    fn rejects_invalid_prefixes() {
        assert!(OutputPaths::new("   ").is_err());
        assert!(OutputPaths::new("runs/../secrets").is_err());
        assert!(OutputPaths::new("runs\\1").is_err());
        assert!(OutputPaths::new("runs/1\n").is_ok());
        assert!(OutputPaths::new("runs/\n/1").is_err());
    }
}
