//! Error types for MIME operations.

use std::string::FromUtf8Error;

/// Result type alias for MIME operations.
pub type Result<T> = std::result::Result<T, Error>;

/// MIME error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid MIME header.
    #[error("Invalid MIME header: {0}")]
    InvalidHeader(String),

    /// Invalid content type.
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),

    /// Invalid encoding.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// UTF-8 decode error.
    #[error("UTF-8 decode error: {0}")]
    Utf8Decode(#[from] FromUtf8Error),

    /// Missing boundary in multipart message.
    #[error("Missing boundary in multipart message")]
    MissingBoundary,

    /// Invalid multipart structure.
    #[error("Invalid multipart structure: {0}")]
    InvalidMultipart(String),

    /// Invalid mailbox address.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending input.
        address: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Missing required header.
    #[error("Missing required header: {0}")]
    MissingHeader(String),

    /// Reading an attachment from disk failed.
    #[error("Failed to read attachment {path}: {source}")]
    Attachment {
        /// Path of the attachment.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
