use streamload_base::{ObjectHandle, PackageName};
use thiserror::Error;

/// Errors that prevent the loader itself from being constructed or configured.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid loader config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to spawn {name}: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single package failed to load. Recorded on the package, logged, and surfaced to
/// completion callbacks as [`LoadResult::Failed`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadFailure {
    #[error("couldn't find file for package {0}")]
    FileNotFound(PackageName),
    #[error("failed to create handle for package {package}: {reason}")]
    HandleCreationFailed { package: PackageName, reason: String },
    #[error("failed to deserialize export {export_index} of package {package}: {reason}")]
    DeserializeFailed {
        package: PackageName,
        export_index: usize,
        reason: String,
    },
    #[error("failed to preload {object:?} while loading package {package}: {reason}")]
    PreloadFailed {
        package: PackageName,
        object: ObjectHandle,
        reason: String,
    },
}

/// Returned by a [`crate::PackageSource`] when a package can't be opened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenPackageError {
    #[error("package file not found")]
    FileNotFound,
    #[error("handle creation failed: {0}")]
    HandleCreationFailed(String),
}

/// Returned by a [`crate::ObjectSystem`] when an object can't be constructed or deserialized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DeserializeError(pub String);

impl DeserializeError {
    pub fn new(reason: impl Into<String>) -> Self {
        DeserializeError(reason.into())
    }
}

/// Result code passed to completion callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadResult {
    Succeeded,
    Failed,
    /// Only produced by an explicit scheduler-wide cancel.
    Canceled,
}
