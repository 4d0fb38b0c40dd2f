//! Error types for connection management and mailbox operations.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by the connection manager.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The credential callback could not be built.
    #[error("Authentication setup failed: {0}")]
    AuthenticationSetup(String),

    /// No connection or pool is registered under the name.
    #[error("Connection '{0}' has not been initialized")]
    NotInitialized(String),

    /// A pooled connection could not be handed out.
    #[error("Connection pool exhausted: {reason}")]
    PoolExhausted {
        /// What went wrong.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Borrow attempted on a closed pool.
    #[error("Connection pool '{0}' is closed")]
    PoolClosed(String),

    /// Destroying idle connections failed while closing a pool.
    #[error("Failed to close {} pooled connection(s)", .0.len())]
    PoolClose(Vec<Error>),

    /// A store or folder could not be reached.
    #[error("Connection failure: {context}: {source}")]
    ConnectionFailure {
        /// What was being attempted.
        context: String,
        /// Transport-level cause.
        #[source]
        source: TransportError,
    },

    /// A message lookup matched nothing.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// The message parser rejected a message.
    #[error("Failed to parse {context}: {source}")]
    Parsing {
        /// Which message failed.
        context: String,
        /// Parser error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A folder or store operation failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// TLS handshake or configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Building an outgoing message failed.
    #[error("Message error: {0}")]
    Message(#[from] mailconn_mime::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] for callers that branch on failure
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::AuthenticationSetup`].
    AuthenticationSetup,
    /// See [`Error::NotInitialized`].
    NotInitialized,
    /// Pool exhausted or closed.
    PoolExhausted,
    /// Pool shutdown failures.
    PoolClose,
    /// Store, folder, stream or TLS failures.
    ConnectionFailure,
    /// See [`Error::NotFound`].
    NotFound,
    /// Parser or message construction failures.
    Parsing,
    /// See [`Error::Timeout`].
    Timeout,
}

impl Error {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::AuthenticationSetup(_) => ErrorKind::AuthenticationSetup,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::PoolExhausted { .. } | Self::PoolClosed(_) => ErrorKind::PoolExhausted,
            Self::PoolClose(_) => ErrorKind::PoolClose,
            Self::ConnectionFailure { .. }
            | Self::Transport(_)
            | Self::Tls(_)
            | Self::InvalidDnsName(_)
            | Self::Io(_) => ErrorKind::ConnectionFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Parsing { .. } | Self::Message(_) => ErrorKind::Parsing,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Returns true for [`ErrorKind::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn exhausted(reason: impl Into<String>, source: Option<Self>) -> Self {
        Self::PoolExhausted {
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }

    pub(crate) fn connection(context: impl Into<String>, source: TransportError) -> Self {
        Self::ConnectionFailure {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            Error::NotFound("<id>".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::PoolClosed("p".into()).kind(),
            ErrorKind::PoolExhausted
        );
        assert_eq!(
            Error::from(TransportError::NotConnected).kind(),
            ErrorKind::ConnectionFailure
        );
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Configuration("x".into()).is_not_found());
    }

    #[test]
    fn test_exhausted_keeps_cause() {
        let err = Error::exhausted(
            "validation failed",
            Some(Error::connection("connect", TransportError::NotConnected)),
        );
        let source = err.source().unwrap();
        assert!(source.to_string().contains("connect"));
    }

    #[test]
    fn test_pool_close_message() {
        let err = Error::PoolClose(vec![
            Error::Configuration("a".into()),
            Error::Configuration("b".into()),
        ]);
        assert_eq!(err.to_string(), "Failed to close 2 pooled connection(s)");
    }
}
