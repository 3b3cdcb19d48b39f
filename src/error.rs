//! Error types for the SiltDB storage engine.

use std::fmt;
use std::io;

/// The result type used throughout SiltDB.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for SiltDB operations.
///
/// Every variant except `Io` carries a primary message; helpers exist to
/// attach a secondary message where call sites have one.
#[derive(Debug)]
pub enum Error {
    /// An I/O error from the underlying filesystem.
    Io(io::Error),

    /// Data corruption was detected (bad checksum, truncated record,
    /// malformed manifest entry, ...).
    Corruption(String),

    /// The requested key or file was not found.
    NotFound(String),

    /// The operation is not supported by this build or configuration.
    NotSupported(String),

    /// An invalid argument or option was provided.
    InvalidArgument(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a corruption error with a secondary message.
    pub fn corruption2(msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Corruption(format!("{}: {}", msg.into(), detail.into()))
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new not supported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

// The background thread stores the first failure and re-reports it on
// later writes, so errors must be cloneable. Io errors are flattened to
// their kind + message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::NotSupported(m) => Error::NotSupported(m.clone()),
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
        }
    }
}
