//! The seam between connection management and a protocol implementation.
//!
//! A [`Transport`] opens [`MailStore`]s for stateful protocols and submits
//! messages for send-only ones. A store opens [`MailFolder`]s, which expose
//! the search, flag, fetch and close primitives that mailbox operations are
//! built from.
//!
//! [`NetworkTransport`] speaks to real servers; [`memory::MemoryServer`]
//! serves tests and embedders.

#[cfg(feature = "imap")]
mod imap;
pub mod memory;
mod net;
mod pop3;
#[cfg(feature = "smtp")]
mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mailconn_mime::OutgoingMessage;
use thiserror::Error;

pub use crate::flags::{Flag, Flags};
use crate::search::SearchTerm;
use crate::session::Session;

pub use net::NetworkTransport;

/// Errors raised by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The folder does not exist.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The folder handle has been closed.
    #[error("Folder '{0}' is closed")]
    FolderClosed(String),

    /// A write was attempted on a read-only folder.
    #[error("Folder '{0}' is open read-only")]
    ReadOnly(String),

    /// The store is not connected.
    #[error("Store is not connected")]
    NotConnected,

    /// The protocol does not support the operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Stream setup or I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other server-side failure.
    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// How a folder is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderMode {
    /// Flags cannot be changed and nothing is expunged.
    ReadOnly,
    /// Flags can be changed and deleted messages expunged.
    ReadWrite,
}

/// A message within an open folder.
///
/// The in-memory and POP3 stores use sequence numbers starting at 1; IMAP
/// stores use UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef(pub u32);

/// A protocol implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates an unconnected store for a stateful session.
    async fn open_store(&self, session: Arc<Session>) -> TransportResult<Box<dyn MailStore>>;

    /// Submits a message through a send-only session.
    async fn send(&self, session: &Session, message: &OutgoingMessage) -> TransportResult<()>;
}

/// A connection to a mail store.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Connects and authenticates.
    async fn connect(&mut self) -> TransportResult<()>;

    /// Whether the store is still usable.
    async fn is_connected(&self) -> bool;

    /// Opens a folder.
    async fn open_folder(
        &mut self,
        name: &str,
        mode: FolderMode,
    ) -> TransportResult<Box<dyn MailFolder>>;

    /// Closes the store.
    async fn close(&mut self) -> TransportResult<()>;
}

/// An open folder.
#[async_trait]
pub trait MailFolder: Send + Sync {
    /// Folder name.
    fn name(&self) -> &str;

    /// Mode the folder was opened with.
    fn mode(&self) -> FolderMode;

    /// Whether the folder handle is still open.
    fn is_open(&self) -> bool;

    /// Number of messages in the folder.
    async fn message_count(&self) -> TransportResult<usize>;

    /// Returns the messages matching `term` in folder order.
    async fn search(&self, term: &SearchTerm) -> TransportResult<Vec<MessageRef>>;

    /// Sets or clears `flags` on each message.
    async fn set_flags(
        &mut self,
        messages: &[MessageRef],
        flags: &Flags,
        set: bool,
    ) -> TransportResult<()>;

    /// Returns the raw RFC 5322 bytes of a message.
    async fn fetch(&self, message: MessageRef) -> TransportResult<Bytes>;

    /// Closes the folder, removing `\Deleted` messages if `expunge` is set.
    async fn close(&mut self, expunge: bool) -> TransportResult<()>;
}
