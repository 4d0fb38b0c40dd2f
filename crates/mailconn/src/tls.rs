//! TLS negotiation for mail sessions.
//!
//! A transport implementation calls [`connect`] to obtain a [`MailStream`]
//! that is already TLS for implicit-TLS sessions, and
//! [`MailStream::upgrade`] after a successful STARTTLS exchange.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::protocol::PropertyKey;
use crate::session::Session;
use crate::{Error, Result};

/// TLS parameters read from a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Host the certificate must be valid for.
    pub host: String,
    /// Allowed cipher suites; empty allows the provider defaults.
    pub cipher_suites: Vec<String>,
    /// Allowed protocol versions; empty allows TLS 1.2 and 1.3.
    pub protocols: Vec<String>,
    /// Hosts trusted without certificate validation, or `*`.
    pub trusted_hosts: Vec<String>,
    /// Reject certificates issued for another host name. When false, any
    /// certificate valid for some other host is accepted.
    pub check_server_identity: bool,
}

impl TlsSettings {
    /// Reads TLS properties from a session.
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        let owned = |key| {
            session
                .list(key)
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        Self {
            host: session.host().to_string(),
            cipher_suites: owned(PropertyKey::SslCipherSuites),
            protocols: owned(PropertyKey::SslProtocols),
            trusted_hosts: owned(PropertyKey::SslTrust),
            check_server_identity: session.flag(PropertyKey::SslCheckServerIdentity),
        }
    }

    /// Whether certificate validation is skipped for this host.
    #[must_use]
    pub fn trusts_host(&self) -> bool {
        self.trusted_hosts
            .iter()
            .any(|h| h == "*" || h.eq_ignore_ascii_case(&self.host))
    }

    /// Builds a client configuration honouring these settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no configured cipher suite or
    /// protocol is supported, and [`Error::Tls`] if the remaining suites
    /// cannot serve the requested versions.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut provider = rustls::crypto::aws_lc_rs::default_provider();
        if !self.cipher_suites.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                self.cipher_suites.iter().any(|wanted| suite_matches(wanted, &name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(Error::Configuration(format!(
                    "None of the cipher suites are supported: {}",
                    self.cipher_suites.join(" ")
                )));
            }
        }

        let versions = self.protocol_versions()?;
        let provider = Arc::new(provider);
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| Error::Configuration(format!("Invalid certificate verifier: {e}")))?;
        let verifier = Arc::new(SessionVerifier {
            inner,
            trust_all: self.trusts_host(),
            check_server_identity: self.check_server_identity,
        });

        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        Ok(config)
    }

    fn protocol_versions(&self) -> Result<Vec<&'static SupportedProtocolVersion>> {
        if self.protocols.is_empty() {
            return Ok(rustls::DEFAULT_VERSIONS.to_vec());
        }
        self.protocols
            .iter()
            .map(|p| {
                let normalized = p.to_ascii_uppercase().replace(['V', '_'], "").replace('.', "");
                match normalized.as_str() {
                    "TLS12" => Ok(&rustls::version::TLS12),
                    "TLS13" => Ok(&rustls::version::TLS13),
                    _ => Err(Error::Configuration(format!("Unsupported TLS protocol: {p}"))),
                }
            })
            .collect()
    }
}

/// Accepts rustls suite names and the IANA spelling of TLS 1.3 suites.
fn suite_matches(wanted: &str, rustls_name: &str) -> bool {
    wanted.eq_ignore_ascii_case(rustls_name)
        || rustls_name
            .strip_prefix("TLS13_")
            .is_some_and(|rest| wanted.eq_ignore_ascii_case(&format!("TLS_{rest}")))
}

/// Certificate verifier applying the session's trust and identity settings
/// on top of WebPKI validation.
#[derive(Debug)]
struct SessionVerifier {
    inner: Arc<WebPkiServerVerifier>,
    trust_all: bool,
    check_server_identity: bool,
}

impl ServerCertVerifier for SessionVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self.trust_all {
            return Ok(ServerCertVerified::assertion());
        }
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(err))
                if !self.check_server_identity && is_name_mismatch(&err) =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// A stream that can be either plaintext or TLS.
#[derive(Debug)]
pub enum MailStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    /// Upgrades a plaintext stream to TLS, e.g. after STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS, the TLS settings are
    /// invalid, or the handshake fails.
    pub async fn upgrade(self, session: &Session) -> Result<Self> {
        match self {
            Self::Plain(tcp) => {
                let settings = TlsSettings::from_session(session);
                let connector = TlsConnector::from(Arc::new(settings.client_config()?));
                let server_name = ServerName::try_from(settings.host.clone())?;
                let tls = connector.connect(server_name, tcp).await?;
                debug!(host = %settings.host, "TLS established");
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(Error::Configuration("Stream is already TLS".to_string())),
        }
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens a connection to the session's server.
///
/// The TCP connect is bounded by the session's connect timeout. Implicit-TLS
/// sessions are returned already encrypted; everything else is plain.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if connecting takes too long, or an I/O or TLS
/// error.
pub async fn connect(session: &Session) -> Result<MailStream> {
    let host = session.host();
    let port = session.port();
    let connect = TcpStream::connect((host, port));
    let tcp = match session.timeout(PropertyKey::ConnectionTimeout) {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| Error::Timeout(limit))??,
        None => connect.await?,
    };
    debug!(%host, port, protocol = %session.protocol(), "connected");

    let stream = MailStream::Plain(tcp);
    if session.uses_implicit_tls() {
        stream.upgrade(session).await
    } else {
        Ok(stream)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::Protocol;
    use crate::session::create_session;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings() -> TlsSettings {
        TlsSettings {
            host: "imap.example.com".into(),
            ..TlsSettings::default()
        }
    }

    #[test]
    fn test_default_client_config() {
        assert!(settings().client_config().is_ok());
    }

    #[test]
    fn test_cipher_suite_filter() {
        let config = TlsSettings {
            cipher_suites: vec!["TLS_AES_256_GCM_SHA384".into()],
            protocols: vec!["TLSv1.3".into()],
            ..settings()
        }
        .client_config()
        .unwrap();
        assert_eq!(config.crypto_provider().cipher_suites.len(), 1);
    }

    #[test]
    fn test_unknown_cipher_suite() {
        let result = TlsSettings {
            cipher_suites: vec!["SSL_RSA_WITH_RC4_128_MD5".into()],
            ..settings()
        }
        .client_config();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_protocol_names() {
        let s = TlsSettings {
            protocols: vec!["TLSv1.2".into(), "tls1.3".into(), "TLSv1_2".into()],
            ..settings()
        };
        assert_eq!(s.protocol_versions().unwrap().len(), 3);

        let s = TlsSettings {
            protocols: vec!["SSLv3".into()],
            ..settings()
        };
        assert!(matches!(s.client_config(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_trusted_hosts() {
        assert!(!settings().trusts_host());
        let s = TlsSettings {
            trusted_hosts: vec!["other".into(), "IMAP.example.com".into()],
            ..settings()
        };
        assert!(s.trusts_host());
        let s = TlsSettings {
            trusted_hosts: vec!["*".into()],
            ..settings()
        };
        assert!(s.trusts_host());
    }

    #[test]
    fn test_name_mismatch_detection() {
        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(is_name_mismatch(&CertificateError::NotValidForNameContext {
            expected: ServerName::try_from("imap.example.com").unwrap(),
            presented: vec!["DnsName(\"mail.example.net\")".into()],
        }));
        assert!(!is_name_mismatch(&CertificateError::Expired));
        assert!(!is_name_mismatch(&CertificateError::UnknownIssuer));
    }

    #[test]
    fn test_settings_from_session() {
        let config = ConnectionConfig::builder("t", "imap.example.com", 993, Protocol::Imaps)
            .credentials("u", "p")
            .cipher_suites("A,B")
            .trusted_hosts("imap.example.com")
            .check_server_identity(true)
            .build();
        let s = TlsSettings::from_session(&create_session(&config).unwrap());
        assert_eq!(s.host, "imap.example.com");
        assert_eq!(s.cipher_suites, vec!["A", "B"]);
        assert!(s.protocols.is_empty());
        assert!(s.trusts_host());
        assert!(s.check_server_identity);
    }

    #[test]
    fn test_identity_check_needs_opt_in() {
        let config = ConnectionConfig::builder("t", "imap.example.com", 993, Protocol::Imaps)
            .credentials("u", "p")
            .build();
        let session = create_session(&config).unwrap();
        assert_eq!(session.get(PropertyKey::SslCheckServerIdentity), None);
        assert!(!TlsSettings::from_session(&session).check_server_identity);
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"* OK ready\r\n").await.unwrap();
        });

        let config = ConnectionConfig::builder("t", "127.0.0.1", port, Protocol::Imap)
            .credentials("u", "p")
            .connect_timeout(std::time::Duration::from_secs(5))
            .build();
        let mut stream = connect(&create_session(&config).unwrap()).await.unwrap();
        assert!(!stream.is_tls());

        let mut greeting = String::new();
        stream.read_to_string(&mut greeting).await.unwrap();
        assert_eq!(greeting, "* OK ready\r\n");
        server.await.unwrap();
    }
}
