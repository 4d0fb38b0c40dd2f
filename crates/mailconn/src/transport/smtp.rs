//! SMTP submission with lettre.
//!
//! A connection is opened for each message and closed once it is accepted;
//! the registry already shares one session per send-only connection.
//! Trusted hosts and `checkserveridentity` map onto lettre's TLS parameters.
//! Cipher suite and protocol restrictions are not applied to SMTP streams.

use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailconn_mime::OutgoingMessage;
use tracing::{debug, warn};

use super::net::read_timeout;
use super::{TransportError, TransportResult};
use crate::protocol::PropertyKey;
use crate::session::Session;
use crate::tls::TlsSettings;

type Mailer = AsyncSmtpTransport<Tokio1Executor>;

/// Submits one message to the session's server.
pub(super) async fn send(session: &Session, message: &OutgoingMessage) -> TransportResult<()> {
    let envelope = envelope(message)?;
    let mailer = mailer(session)?;
    mailer
        .send_raw(&envelope, &message.data)
        .await
        .map_err(|e| {
            warn!(host = %session.host(), error = %e, "submission failed");
            if e.is_permanent() || e.is_transient() {
                TransportError::Operation(e.to_string())
            } else {
                TransportError::Connection(format!("{}:{}: {e}", session.host(), session.port()))
            }
        })?;
    debug!(
        host = %session.host(),
        recipients = message.recipients.len(),
        "message submitted"
    );
    Ok(())
}

fn envelope(message: &OutgoingMessage) -> TransportResult<Envelope> {
    let parse = |addr: &str| {
        addr.parse::<Address>()
            .map_err(|e| TransportError::Operation(format!("invalid address '{addr}': {e}")))
    };
    let sender = message.sender.as_deref().map(parse).transpose()?;
    let recipients = message
        .recipients
        .iter()
        .map(|r| parse(r))
        .collect::<TransportResult<Vec<_>>>()?;
    Envelope::new(sender, recipients).map_err(|e| TransportError::Operation(e.to_string()))
}

fn mailer(session: &Session) -> TransportResult<Mailer> {
    let host = session.host();
    let mut builder = Mailer::builder_dangerous(host).port(session.port());

    if let Some(limit) = read_timeout(session) {
        builder = builder.timeout(Some(limit));
    }

    builder = if session.uses_implicit_tls() {
        builder.tls(Tls::Wrapper(tls_parameters(session)?))
    } else if session.uses_starttls() {
        builder.tls(Tls::Required(tls_parameters(session)?))
    } else {
        builder.tls(Tls::None)
    };

    if session.flag(PropertyKey::Auth) {
        let auth = session.authentication();
        builder = builder.credentials(Credentials::new(
            auth.username().to_string(),
            auth.password().to_string(),
        ));
    }
    Ok(builder.build())
}

fn tls_parameters(session: &Session) -> TransportResult<TlsParameters> {
    let settings = TlsSettings::from_session(session);
    TlsParameters::builder(settings.host.clone())
        .dangerous_accept_invalid_certs(settings.trusts_host())
        .dangerous_accept_invalid_hostnames(!settings.check_server_identity)
        .build()
        .map_err(|e| TransportError::Connection(format!("TLS configuration failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::Protocol;
    use crate::session::create_session;

    #[test]
    fn test_envelope_addresses() {
        let message = OutgoingMessage::new(
            Some("support@example.com".into()),
            vec!["a@example.com".into(), "b@example.org".into()],
            b"Subject: hi\r\n\r\nbody".to_vec(),
        );
        let envelope = envelope(&message).unwrap();
        assert_eq!(
            envelope.from().map(ToString::to_string).as_deref(),
            Some("support@example.com")
        );
        assert_eq!(envelope.to().len(), 2);
    }

    #[test]
    fn test_envelope_needs_recipients() {
        let message = OutgoingMessage::new(None, Vec::new(), b"x".to_vec());
        assert!(matches!(envelope(&message), Err(TransportError::Operation(_))));

        let message = OutgoingMessage::new(None, vec!["not an address".into()], b"x".to_vec());
        let err = envelope(&message).unwrap_err();
        assert!(err.to_string().contains("not an address"), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::builder("out", "127.0.0.1", port, Protocol::Smtp)
            .credentials("u", "p")
            .build();
        let session = create_session(&config).unwrap();
        let message = OutgoingMessage::new(None, vec!["a@example.com".into()], b"x".to_vec());
        let err = send(&session, &message).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)), "{err}");
    }
}
