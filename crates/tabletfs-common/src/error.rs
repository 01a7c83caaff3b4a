//! Error types for TabletFS
//!
//! Every fallible operation in the storage layer returns [`Result`]. The
//! error carries one of a small set of kinds plus a human-readable message
//! that accumulates context (what was attempted, on which path) as it
//! propagates upwards.

use std::path::Path;
use thiserror::Error;

/// Common result type for TabletFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for TabletFS
#[derive(Debug, Error)]
pub enum Error {
    /// Bad root syntax, missing required root, or an unsupported option
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// OS-level failure while creating, reading or writing
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Bootstrap attempted over a non-empty root, or a no-overwrite write hit an existing file
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Structural inconsistency found on disk
    #[error("corruption: {0}")]
    Corruption(String),

    /// Missing instance metadata, unknown block id, and similar
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was called in a state that does not allow it
    #[error("logic error: {0}")]
    LogicError(String),
}

/// Discriminant of [`Error`], convenient for matching in callers and tests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidConfig,
    Io,
    AlreadyExists,
    Corruption,
    NotFound,
    LogicError,
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a logic error
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::LogicError(msg.into())
    }

    /// Get the kind of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Io { .. } => ErrorKind::Io,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LogicError(_) => ErrorKind::LogicError,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a corruption error
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Check if this error was caused by the disk itself rather than by the
    /// state of the data on it
    #[must_use]
    pub const fn is_disk_failure(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Prefix the message with `ctx`, keeping the kind and any source
    #[must_use]
    pub fn prepend(self, ctx: impl AsRef<str>) -> Self {
        let ctx = ctx.as_ref();
        match self {
            Self::InvalidConfig(m) => Self::InvalidConfig(format!("{ctx}: {m}")),
            Self::Io { context, source } => Self::Io {
                context: format!("{ctx}: {context}"),
                source,
            },
            Self::AlreadyExists(m) => Self::AlreadyExists(format!("{ctx}: {m}")),
            Self::Corruption(m) => Self::Corruption(format!("{ctx}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::LogicError(m) => Self::LogicError(format!("{ctx}: {m}")),
        }
    }

    /// Map an I/O error on `path` to the closest error kind
    ///
    /// `NotFound` and `AlreadyExists` keep their meaning; everything else
    /// becomes [`Error::Io`].
    pub fn from_io_at(what: &str, path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => {
                Self::NotFound(format!("{what} {}: {source}", path.display()))
            }
            std::io::ErrorKind::AlreadyExists => {
                Self::AlreadyExists(format!("{what} {}: {source}", path.display()))
            }
            _ => Self::io(format!("{what} {}", path.display()), source),
        }
    }
}

/// Attach context to `std::io::Result` values
pub trait IoResultExt<T> {
    /// Convert the error into [`Error`], describing the operation on `path`
    fn at_path(self, what: &str, path: &Path) -> Result<T>;

    /// Convert the error into [`Error::Io`] with a free-form context
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, what: &str, path: &Path) -> Result<T> {
        self.map_err(|e| Error::from_io_at(what, path, e))
    }

    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::io(context(), e))
    }
}
