//! # mailconn-mime
//!
//! MIME support for the `mailconn` connection manager.
//!
//! ## Features
//!
//! - **Message parsing**: headers plus nested multipart bodies
//! - **Message building**: RFC 5322 output with attachments and envelope data
//! - **Encoding/Decoding**: Base64, Quoted-Printable, RFC 2047 header words
//! - **Addresses**: mailbox and address-list parsing
//!
//! ## Parsing
//!
//! ```
//! use mailconn_mime::Message;
//!
//! let raw = b"From: sender@example.com\r\nSubject: Test\r\n\r\nHello, World!";
//! let message = Message::parse(raw)?;
//! assert_eq!(message.subject().as_deref(), Some("Test"));
//! assert_eq!(message.text_body("plain")?.as_deref(), Some("Hello, World!"));
//! # Ok::<(), mailconn_mime::Error>(())
//! ```
//!
//! ## Building
//!
//! ```
//! use mailconn_mime::MessageBuilder;
//!
//! let message = MessageBuilder::new()
//!     .from("sender@example.com")
//!     .to("recipient@example.com")
//!     .bcc("audit@example.com")
//!     .subject("Report")
//!     .body("See attached.", "text/plain")
//!     .attach("report.csv", "text/csv", "a,b\n1,2\n")
//!     .build()?;
//!
//! assert_eq!(message.recipients.len(), 2);
//! # Ok::<(), mailconn_mime::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
mod builder;
mod content_type;
mod error;
mod header;
mod message;

pub mod encoding;

pub use address::{Address, format_address_list, parse_address_list};
pub use builder::{MessageBuilder, OutgoingMessage, guess_content_type};
pub use content_type::ContentType;
pub use error::{Error, Result};
pub use header::Headers;
pub use message::{Body, Disposition, Entity, Message, TransferEncoding};
