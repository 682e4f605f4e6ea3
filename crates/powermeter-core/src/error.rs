//! Error types shared across the crate
//!
//! Every fallible operation returns [`Result`]. Errors are annotated with
//! context at each layer boundary through [`ResultExt`], so a failure deep in
//! the storage backend reads as a causal chain once it reaches a task
//! supervisor:
//!
//! ```text
//! tracking tick: tracker 3600_60: writing /Trackers/3600_60/data.json (slot b): I/O error on ...
//! ```

use alloc::boxed::Box;
use alloc::string::String;
use thiserror_no_std::Error as ThisError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failures reported by a [`Storage`](crate::storage::Storage) backend.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },
}

impl StorageError {
    pub fn io(path: &str, reason: impl core::fmt::Display) -> Self {
        use alloc::string::ToString;

        Self::Io {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("invalid JSON in {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("pointer {pointer} not found in {path}")]
    PointerNotFound { path: String, pointer: String },
    /// Neither slot of a redundant resource holds a readable value.
    #[error("no readable data for {path}")]
    NoData { path: String },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown tracker {0}")]
    UnknownTracker(String),
    /// Internal invariant violation; logged and surfaced, never corrected.
    #[error("tracker {title} holds {len} samples but its capacity is {capacity}")]
    CapacityExceeded {
        title: String,
        len: usize,
        capacity: usize,
    },
    #[error("failed to spawn task {name}: {reason}")]
    Spawn { name: String, reason: String },
    #[error("{context}: {inner}")]
    Context { context: String, inner: Box<Error> },
}

impl Error {
    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            inner: Box::new(self),
        }
    }

    /// The innermost error of a context chain.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Self::Context { inner, .. } = current {
            current = inner;
        }
        current
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self.root(), Self::NoData { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::Storage(StorageError::NotFound(_)))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Context annotation for results, in the spirit of `anyhow::Context`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for core::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
