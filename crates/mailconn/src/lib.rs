//! # mailconn
//!
//! Connection management for SMTP, IMAP and POP3.
//!
//! ## Features
//!
//! - **Sessions from configuration**: one flat record per named connection,
//!   turned into protocol properties, credentials and TLS settings
//! - **Connection registry**: send-only protocols share one connection per
//!   name; stateful protocols get a bounded pool
//! - **Bounded pools**: `FAIL`, `BLOCK` (with optional max wait) and `GROW`
//!   exhaustion policies, validation on borrow, idle limits and eviction
//! - **Folder state machine**: at most one open folder per connection,
//!   reused when the same folder and mode are requested again
//! - **Mailbox operations**: list with filters and paging, flag changes,
//!   delete, expunge, send
//! - **TLS via rustls**: cipher, protocol and trust settings applied to
//!   implicit TLS and STARTTLS streams
//! - **Network transport**: IMAP through async-imap, SMTP submission through
//!   lettre and a built-in POP3 client (`imap` and `smtp` cargo features)
//! - **In-memory transport**: a loopback mail server for tests and embedders
//!
//! ## Quick Start
//!
//! ```
//! use mailconn::{
//!     ConnectionConfig, ConnectionRegistry, MailboxQuery, MimeParser, Protocol,
//!     list_messages,
//!     transport::memory::MemoryServer,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mailconn::Result<()> {
//! let server = MemoryServer::new();
//! server.add_account("support", "s3cret");
//! server.deliver("support", "INBOX", b"Subject: Hello\r\n\r\nWorld".as_slice())?;
//!
//! let registry = ConnectionRegistry::new(server.transport());
//! let config = ConnectionConfig::builder("support", "imap.example.com", 993, Protocol::Imaps)
//!     .credentials("support", "s3cret")
//!     .build();
//! registry.create_connection(&config)?;
//!
//! let pool = registry.get_connection_pool("support")?;
//! let conn = pool.borrow().await?;
//! let messages = list_messages(&conn, &MailboxQuery::default(), &MimeParser).await?;
//! assert_eq!(messages[0].subject, "Hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: connection and query configuration
//! - [`session`]: session factory
//! - [`tls`]: TLS configuration and streams for transport implementations
//! - [`transport`]: the protocol seam with the network and in-memory
//!   transports
//! - [`pool`]: the generic bounded pool

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod connection;
mod error;
mod factory;
mod flags;
mod mailbox;
mod message;
mod operations;
mod parser;
pub mod pool;
mod protocol;
mod registry;
mod search;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, Credentials, DEFAULT_FOLDER, ExhaustedAction,
    MailboxQuery, PoolConfig, Timeouts, TlsOptions,
};
pub use connection::{Connection, MailConnection};
pub use error::{Error, ErrorKind, Result};
pub use factory::{ConnectionPool, MailboxConnectionFactory};
pub use flags::{Flag, Flags};
pub use mailbox::{FolderStatus, MailboxConnection, OpenFolder};
pub use message::{Attachment, EmailMessage};
pub use operations::{
    change_state, delete_message, expunge_folder, list_messages, mark_as_deleted, send_message,
};
pub use parser::{MessageParser, MimeParser, ParseError};
pub use pool::{Pool, PoolFactory, Pooled};
pub use protocol::{PropertyKey, Protocol, TRANSPORT_PROTOCOL};
pub use registry::{ConnectionRegistry, PoolCloseFailure};
pub use search::{MessageMeta, SearchTerm};
pub use session::{Authenticator, PasswordAuthentication, Session, create_session};
pub use transport::{
    FolderMode, MailFolder, MailStore, MessageRef, NetworkTransport, Transport, TransportError,
    TransportResult,
};

pub use mailconn_mime::{MessageBuilder, OutgoingMessage};
