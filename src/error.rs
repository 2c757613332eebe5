use thiserror::Error;

/// Type alias for Result with SentinelError
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Error taxonomy for the mail processing engine.
///
/// Each variant maps to one of the error kinds the processing controller
/// and IMAP adapter reason about: config/auth problems surface immediately,
/// network/protocol/classifier/persistence problems are handled locally and
/// only ever show up in session counters and analytics.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Malformed account or global configuration. Fatal at startup, never during a session.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Credentials rejected by the provider. Session aborts; not retried.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Transient connectivity/timeout. Retried with exponential backoff up to three attempts.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Unexpected IMAP response, including a `ProviderRejection` of the current operation.
    #[error("IMAP protocol error: {0}")]
    ProtocolError(String),

    /// A folder's UIDVALIDITY changed mid-session; in-flight batch is invalidated.
    #[error("UIDVALIDITY changed for folder {folder}: {old} -> {new}")]
    UidValidityChanged {
        folder: String,
        old: u32,
        new: u32,
    },

    /// Model load failure or Tier 3 timeout. Degrades to the prior tier; not fatal.
    #[error("classifier error: {0}")]
    ClassifierError(String),

    /// Database write failure. The offending row is not committed.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// A PROTECT and DELETE flag are both present for the same message_id.
    /// Resolved in favor of PROTECT; this variant carries the advisory warning.
    #[error("flag conflict for message {message_id}: PROTECT and DELETE both present, PROTECT wins")]
    FlagConflict { message_id: String },

    /// Circuit breaker is open, rejecting requests until the reset timeout elapses.
    #[error("circuit breaker open: {message}. retry after {retry_after_secs}s")]
    CircuitBreakerOpen {
        message: String,
        retry_after_secs: u64,
    },

    /// Cooperative cancellation observed between batches or before an IMAP op.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// IO error (state files, database file, credential files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// TOML parsing error for configuration files.
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Underlying SQLite error from the persistence layer.
    #[error("sqlite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// Generic catch-all, used sparingly.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SentinelError {
    /// Check if the error is transient and should be retried by the IMAP adapter
    /// or counted towards the circuit breaker's failure threshold.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SentinelError::NetworkError(_)
                | SentinelError::ProtocolError(_)
                | SentinelError::CircuitBreakerOpen { .. }
        )
    }

    /// Check if the error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Whether this error kind is expected-path: handled locally via counters/analytics
    /// rather than surfaced immediately to the operator (policy in spec §7).
    pub fn is_expected_path(&self) -> bool {
        matches!(
            self,
            SentinelError::NetworkError(_)
                | SentinelError::ClassifierError(_)
                | SentinelError::PersistenceError(_)
        )
    }
}
