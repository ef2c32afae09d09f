use thiserror::Error;

/// Core error types for dbgate
#[derive(Debug, Error)]
pub enum Error {
    /// Input validation failed; nothing was changed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The firewall backend rejected the rule update or did not answer in time
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// Allowlist persistence failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Creates a validation error for the `ips` field
    pub fn invalid_ips(message: impl Into<String>) -> Self {
        Self::Validation {
            field: "ips".to_string(),
            message: message.into(),
        }
    }

    /// Whether the caller can fix this by changing its input
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// Failure reported by a firewall backend.
///
/// The message is forwarded as-is; backends never classify their errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FirewallError {
    message: String,
}

impl FirewallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Allowlist store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid entity name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,

    #[error("Allowlist file for {entity} is corrupted: {reason}")]
    Corrupted { entity: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
