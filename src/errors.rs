//! The error kinds the engine distinguishes.
//!
//! Per-file trouble (open failure, hash mismatch) is *not* an error here -
//! those files are skipped, counted, and picked up on the next sync cycle.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid store, bad port, bad path.
    #[error("configuration: {0}")]
    Config(String),

    /// Sync, tree, device, or favorite unknown.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate create, nested tree root, sync exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation denied by the sync permission or tree role.
    #[error("permission denied: {0}")]
    Permission(String),

    /// OS read/write failure. ENOSPC lands here and is always fatal
    /// to the task that hit it.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Socket, timeout, HTTP parse, or peer-refused failure.
    #[error("network: {0}")]
    Network(String),

    /// TAR parse error, SHA-1 mismatch, undecodable message.
    #[error("bad content: {0}")]
    Content(String),

    /// Cooperative abort; reported silently.
    #[error("cancelled")]
    Cancelled,

    /// Non-fatal refusal, e.g. the tree-pair lock was held.
    /// The caller reschedules.
    #[error("busy: {0}")]
    Again(&'static str),

    /// Failure in the backing metadata store. The batch that hit it
    /// is rolled back whole; no USNs are consumed.
    #[error("metadata store: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl Error {
    pub fn config<S: Into<String>>(what: S) -> Self {
        Error::Config(what.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict<S: Into<String>>(what: S) -> Self {
        Error::Conflict(what.into())
    }

    pub fn permission<S: Into<String>>(what: S) -> Self {
        Error::Permission(what.into())
    }

    pub fn network<S: Into<String>>(what: S) -> Self {
        Error::Network(what.into())
    }

    pub fn content<S: Into<String>>(what: S) -> Self {
        Error::Content(what.into())
    }

    /// May the same task succeed if simply run again?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Again(_))
    }

    /// Stable label for status reporting and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::NotFound(_) => "not-found",
            Error::Conflict(_) => "conflict",
            Error::Permission(_) => "permission",
            Error::Io(_) => "io",
            Error::Network(_) => "network",
            Error::Content(_) => "content",
            Error::Cancelled => "cancelled",
            Error::Again(_) => "again",
            Error::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryability() {
        assert!(Error::network("connection reset").is_retryable());
        assert!(Error::Again("tree pair busy").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::content("truncated tar header").is_retryable());
        let enospc = Error::Io(std::io::Error::from_raw_os_error(28));
        assert!(!enospc.is_retryable());
    }
}
