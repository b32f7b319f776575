//! Error types for the blockwatch core.

use thiserror::Error;

/// Errors that can occur while queueing, gating or processing watch jobs.
#[derive(Debug, Error)]
pub enum BlockwatchError {
    /// The remote API rejected the subject's credentials (revoked or expired).
    #[error("remote API rejected the subject's credentials")]
    Unauthorized,

    /// Temporary failure of the remote API or a momentary remote rate-limit rejection.
    #[error("transient remote failure: {msg}")]
    Transient {
        /// Error message describing the failure.
        msg: String,
    },

    /// Remote failure that will not resolve by retrying.
    #[error("permanent remote failure: {msg}")]
    Permanent {
        /// Error message describing the failure.
        msg: String,
    },

    /// The operation was cancelled by one of its cancellation signals.
    #[error("operation cancelled")]
    Cancelled,

    /// A queue or rate gate was used after it was closed.
    #[error("{what} is closed")]
    Closed {
        /// The closed component.
        what: &'static str,
    },

    /// Persistence collaborator failure.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the failure.
        msg: String,
    },

    /// Notification dispatch failure.
    #[error("notification error: {msg}")]
    Notify {
        /// Error message describing the failure.
        msg: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason why the configuration is invalid.
        reason: String,
    },

    /// Credential sealing or unsealing failed.
    #[error("credential sealing failed: {msg}")]
    Sealing {
        /// Error message describing the failure.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl BlockwatchError {
    /// Errors the continuous loop swallows and retries on its next iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlockwatchError::Transient { .. } | BlockwatchError::Store { .. })
    }

    /// Whether the subject has to re-authorize before any retry can succeed.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BlockwatchError::Unauthorized)
    }

    /// Whether the error stems from a fired cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlockwatchError::Cancelled)
    }

    /// Short, stable name of the variant, recorded in exception logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BlockwatchError::Unauthorized => "Unauthorized",
            BlockwatchError::Transient { .. } => "Transient",
            BlockwatchError::Permanent { .. } => "Permanent",
            BlockwatchError::Cancelled => "Cancelled",
            BlockwatchError::Closed { .. } => "Closed",
            BlockwatchError::Store { .. } => "Store",
            BlockwatchError::Notify { .. } => "Notify",
            BlockwatchError::InvalidConfig { .. } => "InvalidConfig",
            BlockwatchError::Sealing { .. } => "Sealing",
            BlockwatchError::Io(_) => "Io",
            BlockwatchError::Serialization(_) => "Serialization",
        }
    }

    pub(crate) fn transient(msg: impl Into<String>) -> Self {
        BlockwatchError::Transient { msg: msg.into() }
    }

    pub(crate) fn permanent(msg: impl Into<String>) -> Self {
        BlockwatchError::Permanent { msg: msg.into() }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        BlockwatchError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type alias for blockwatch operations.
pub type Result<T> = std::result::Result<T, BlockwatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BlockwatchError::transient("503").is_transient());
        assert!(BlockwatchError::Store { msg: "locked".into() }.is_transient());
        assert!(!BlockwatchError::permanent("404").is_transient());
        assert!(!BlockwatchError::Unauthorized.is_transient());
        assert!(BlockwatchError::Unauthorized.is_unauthorized());
        assert!(BlockwatchError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_display_messages() {
        let err = BlockwatchError::Closed { what: "rate gate" };
        assert_eq!(err.to_string(), "rate gate is closed");
        let err = BlockwatchError::invalid_config("capacity must be positive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: capacity must be positive"
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(BlockwatchError::Unauthorized.kind(), "Unauthorized");
        assert_eq!(BlockwatchError::transient("x").kind(), "Transient");
        let io = BlockwatchError::from(std::io::Error::other("disk"));
        assert_eq!(io.kind(), "Io");
    }
}
