//! Error kinds surfaced by the class repository.
//!
//! Parse failures are local to one class, I/O failures carry the offending path,
//! and `TargetTerminated` is the one condition callers are expected to treat as
//! fatal for the whole profiling session. A class that cannot be found anywhere is
//! *not* an error: lookups report it as `Ok(None)`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassError {
    /// Malformed class file: bad magic or version, bad constant pool tag or
    /// cross-reference, truncated structure.
    #[error("error reading class {class:?} at byte {position}: {message}")]
    Format {
        class: String,
        position: usize,
        message: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read archive {path}: {source}")]
    Jar {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("could not find entry {entry} in {path}")]
    MissingEntry { path: PathBuf, entry: String },

    /// Source-line mapping was requested on a class compiled without line tables.
    #[error("class {class} does not have source line number tables, recompile it with debug info")]
    NoDebugInfo { class: String },

    #[error("{message}")]
    BadLocation { message: String },

    #[error("target VM terminated")]
    TargetTerminated,

    #[error("invalid session config: {message}")]
    Config { message: String },

    #[error("target client failure: {message}")]
    Client { message: String },
}

pub type Result<T> = std::result::Result<T, ClassError>;

/// Marker a [`TargetClient`](crate::client::TargetClient) puts into its error chain
/// when the profiled process is gone.
#[derive(Debug, Clone, Copy, Error)]
#[error("target VM terminated")]
pub struct TargetTerminated;

impl ClassError {
    pub(crate) fn format(class: &str, position: usize, message: impl Into<String>) -> Self {
        ClassError::Format {
            class: class.to_string(),
            position,
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ClassError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn jar(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        ClassError::Jar {
            path: path.into(),
            source,
        }
    }

    /// Classifies a failure reported by the target client.
    pub(crate) fn from_client(err: anyhow::Error) -> Self {
        if err.chain().any(|cause| cause.is::<TargetTerminated>()) {
            ClassError::TargetTerminated
        } else {
            ClassError::Client {
                message: format!("{err:#}"),
            }
        }
    }

    pub fn is_target_terminated(&self) -> bool {
        matches!(self, ClassError::TargetTerminated)
    }

    pub fn is_format(&self) -> bool {
        matches!(self, ClassError::Format { .. })
    }
}
