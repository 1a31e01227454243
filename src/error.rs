use std::path::PathBuf;

use crate::state::FileState;

/// All errors that can occur in ragforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("initialization error: {0}")]
    Init(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse error in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("reference resolution error: {0}")]
    Link(String),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("graph store error: {message}")]
    GraphStore { message: String, transient: bool },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: FileState, to: FileState },

    #[error("{name} lock acquisition timed out (held by: {owner})")]
    LockTimeout { name: String, owner: String },

    #[error("watch error: {0}")]
    Watch(String),

    #[error("full-text search error: {0}")]
    Fts(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("project not registered: {}", path.display())]
    ProjectNotRegistered { path: PathBuf },

    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl Error {
    /// Build a transient graph-store error (current batch is retried once).
    pub fn store_transient(message: impl Into<String>) -> Self {
        Error::GraphStore {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a fatal graph-store error (surfaced to the caller).
    pub fn store_fatal(message: impl Into<String>) -> Self {
        Error::GraphStore {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the failed operation once is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::GraphStore { transient: true, .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_variant_formats() {
        let err = Error::Config("bad key".into());
        assert_eq!(err.to_string(), "configuration error: bad key");
    }

    #[test]
    fn parse_variant_formats() {
        let err = Error::Parse {
            path: PathBuf::from("src/a.ts"),
            message: "unexpected token".into(),
        };
        let s = err.to_string();
        assert!(s.contains("src/a.ts"));
        assert!(s.contains("unexpected token"));
    }

    #[test]
    fn lock_timeout_names_holder() {
        let err = Error::LockTimeout {
            name: "ingestion".into(),
            owner: "watcher flush".into(),
        };
        let s = err.to_string();
        assert!(s.contains("ingestion"));
        assert!(s.contains("watcher flush"));
    }

    #[test]
    fn invalid_transition_formats() {
        let err = Error::InvalidTransition {
            from: FileState::Parsed,
            to: FileState::Discovered,
        };
        assert_eq!(err.to_string(), "invalid state transition: parsed -> discovered");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::store_transient("socket reset").is_transient());
        assert!(!Error::store_fatal("auth failed").is_transient());
        assert!(!Error::Config("x".into()).is_transient());
    }

    #[test]
    fn io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
