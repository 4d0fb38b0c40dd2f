//! [`Transport`] that talks to real servers over TCP.
//!
//! IMAP stores are driven by async-imap and SMTP submission by lettre;
//! POP3 is a small line protocol spoken directly. IMAP and POP3 streams come
//! from [`tls::connect`], so cipher, protocol and trust settings apply to
//! them, including after STARTTLS.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailconn_mime::OutgoingMessage;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use super::pop3::Pop3Store;
use super::{MailStore, Transport, TransportError, TransportResult};
use crate::protocol::{PropertyKey, Protocol};
use crate::session::Session;
use crate::tls::{self, MailStream};

/// Speaks IMAP, POP3 and SMTP to the host named by each session.
///
/// ```no_run
/// use std::sync::Arc;
/// use mailconn::{ConnectionRegistry, transport::NetworkTransport};
///
/// let registry = ConnectionRegistry::new(Arc::new(NetworkTransport::new()));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkTransport;

impl NetworkTransport {
    /// Creates the transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn open_store(&self, session: Arc<Session>) -> TransportResult<Box<dyn MailStore>> {
        match session.protocol() {
            Protocol::Imap | Protocol::Imaps => imap_store(session),
            Protocol::Pop3 | Protocol::Pop3s => Ok(Box::new(Pop3Store::new(session))),
            other => Err(TransportError::Unsupported(format!(
                "{other} has no mail store"
            ))),
        }
    }

    async fn send(&self, session: &Session, message: &OutgoingMessage) -> TransportResult<()> {
        match session.protocol() {
            Protocol::Smtp | Protocol::Smtps => smtp_send(session, message).await,
            other => Err(TransportError::Unsupported(format!(
                "{other} cannot submit messages"
            ))),
        }
    }
}

#[cfg(feature = "imap")]
fn imap_store(session: Arc<Session>) -> TransportResult<Box<dyn MailStore>> {
    Ok(Box::new(super::imap::ImapStore::new(session)))
}

#[cfg(not(feature = "imap"))]
fn imap_store(_session: Arc<Session>) -> TransportResult<Box<dyn MailStore>> {
    Err(TransportError::Unsupported(
        "built without the `imap` feature".into(),
    ))
}

#[cfg(feature = "smtp")]
async fn smtp_send(session: &Session, message: &OutgoingMessage) -> TransportResult<()> {
    super::smtp::send(session, message).await
}

#[cfg(not(feature = "smtp"))]
async fn smtp_send(_session: &Session, _message: &OutgoingMessage) -> TransportResult<()> {
    Err(TransportError::Unsupported(
        "built without the `smtp` feature".into(),
    ))
}

/// Connects with [`tls::connect`], reporting failures as connection errors.
pub(super) async fn open_stream(session: &Session) -> TransportResult<MailStream> {
    tls::connect(session).await.map_err(|e| {
        TransportError::Connection(format!("{}:{}: {e}", session.host(), session.port()))
    })
}

/// Upgrades a stream after the server accepted STARTTLS.
pub(super) async fn upgrade(stream: MailStream, session: &Session) -> TransportResult<MailStream> {
    let stream = stream
        .upgrade(session)
        .await
        .map_err(|e| TransportError::Connection(format!("STARTTLS handshake failed: {e}")))?;
    debug!(host = %session.host(), "STARTTLS complete");
    Ok(stream)
}

/// The session's read timeout.
pub(super) fn read_timeout(session: &Session) -> Option<Duration> {
    session.timeout(PropertyKey::Timeout)
}

/// Bounds `op` by `limit` when one is set.
pub(super) async fn deadline<T>(
    limit: Option<Duration>,
    op: impl Future<Output = TransportResult<T>>,
) -> TransportResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| TransportError::Operation(format!("no response within {limit:?}")))?,
        None => op.await,
    }
}

/// Reads one CRLF-terminated line, without the terminator.
pub(super) async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> TransportResult<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(TransportError::Connection(
            "server closed the connection".into(),
        ));
    }
    line.truncate(line.trim_end_matches(['\r', '\n']).len());
    Ok(line)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::session::create_session;
    use tokio::io::BufReader;

    fn session(protocol: Protocol) -> Arc<Session> {
        let config = ConnectionConfig::builder("net", "127.0.0.1", 1, protocol)
            .credentials("u", "p")
            .build();
        Arc::new(create_session(&config).unwrap())
    }

    #[tokio::test]
    async fn test_protocol_dispatch() {
        let transport = NetworkTransport::new();
        let message = OutgoingMessage::new(None, vec!["a@example.com".into()], b"x".to_vec());

        let err = transport.send(&session(Protocol::Imap), &message).await.unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
        assert!(transport.open_store(session(Protocol::Smtp)).await.is_err());
        assert!(transport.open_store(session(Protocol::Pop3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_line() {
        let mut reader = BufReader::new(&b"+OK ready\r\n* BYE\n"[..]);
        assert_eq!(read_line(&mut reader).await.unwrap(), "+OK ready");
        assert_eq!(read_line(&mut reader).await.unwrap(), "* BYE");
        assert!(matches!(
            read_line(&mut reader).await,
            Err(TransportError::Connection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };
        let err = deadline(Some(Duration::from_secs(1)), slow).await.unwrap_err();
        assert!(err.to_string().contains("no response"));
        assert_eq!(deadline(None, async { Ok(7) }).await.unwrap(), 7);
    }
}
