use thiserror::Error;

/// Crate wide error taxonomy.
///
/// The fetch planner handles `Network` at per-object granularity (warn and
/// skip); `Integrity` and `Malformed` always propagate to the caller.
#[derive(Error, Debug)]
pub enum KegError {
    #[error("network failure for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("integrity failure for {object}: expected {expected}, got {actual}")]
    Integrity {
        object: String,
        expected: String,
        actual: String,
    },

    #[error("chunk {chunk} is encrypted and no key is available")]
    EncryptedChunk { chunk: usize },

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("ambiguous version selector, matching (build_config, cdn_config) pairs: {pairs:?}")]
    Ambiguous { pairs: Vec<(String, String)> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

impl KegError {
    /// Process exit code for the error class. Integrity and parse failures
    /// are distinguished from transport failures so callers can tell
    /// corruption from a flaky mirror.
    pub fn exit_code(&self) -> i32 {
        match self {
            KegError::Network { .. } => 2,
            KegError::Integrity { .. } | KegError::Malformed { .. } => 3,
            KegError::EncryptedChunk { .. } => 4,
            KegError::NotFound { .. } | KegError::Ambiguous { .. } => 5,
            KegError::Io(_) | KegError::Sql(_) => 1,
        }
    }
}
