use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// Result type used across the crate.
pub type Result<T, E = ReproError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReproError {
    /// A named catalog, artifact, datasource or edge is absent when required.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// An overwrite was attempted without an explicit force/overwrite flag.
    #[error("{kind} '{name}' already exists: {reason}")]
    ObjectCollision {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// A hash check failed.
    #[error("Validation failed for '{name}': {reason}")]
    Validation { name: String, reason: String },

    /// Invalid argument combinations and unresolvable function references.
    #[error("{0}")]
    Engine(String),

    #[error("I/O error at {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Couldn't encode or decode '{path}': {reason}")]
    Cbor { path: Utf8PathBuf, reason: String },

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't fetch '{file}': {reason}")]
    Fetch { file: String, reason: String },

    #[error("Step '{step}':\n{error}")]
    Step { step: String, error: RuntimeError },

    #[error("Edge '{edge}' failed:\n{}", DisplayFailures(.failures))]
    EdgeFailed {
        edge: String,
        failures: Vec<OutputFailure>,
    },
}

impl ReproError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn collision(
        kind: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ObjectCollision {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_collision(&self) -> bool {
        matches!(self, Self::ObjectCollision { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// A single output that could not be committed while processing an edge.
#[derive(Debug)]
pub struct OutputFailure {
    pub artifact: String,
    pub error: ReproError,
}

struct DisplayFailures<'a>(&'a [OutputFailure]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in self.0 {
            writeln!(f, "  {}: {}", failure.artifact, failure.error)?;
        }
        Ok(())
    }
}

/// Attach the offending path to `std::io::Error`s.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Utf8Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Utf8Path>) -> Result<T> {
        self.map_err(|source| ReproError::Io {
            path: path.as_ref().to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_failure_lists_every_output() {
        let err = ReproError::EdgeFailed {
            edge: "_clean".into(),
            failures: vec![
                OutputFailure {
                    artifact: "clean".into(),
                    error: ReproError::validation("clean", "sha256:aa != sha256:bb"),
                },
                OutputFailure {
                    artifact: "extra".into(),
                    error: ReproError::not_found("output", "extra"),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("_clean"));
        assert!(msg.contains("sha256:aa != sha256:bb"));
        assert!(msg.contains("output 'extra' not found"));
    }

    #[test]
    fn io_context_keeps_path() {
        let res: std::io::Result<()> = Err(std::io::Error::other("boom"));
        let err = res.at("catalog/datasets/raw.json").unwrap_err();
        assert!(err.to_string().contains("catalog/datasets/raw.json"));
    }
}
