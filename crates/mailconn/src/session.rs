//! Authenticated mail sessions built from connection configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::ConnectionConfig;
use crate::protocol::{PropertyKey, Protocol, TRANSPORT_PROTOCOL};
use crate::{Error, Result};

/// Credentials handed to a transport when it authenticates.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordAuthentication {
    username: String,
    password: String,
}

impl PasswordAuthentication {
    /// Login name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for PasswordAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuthentication")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Callback producing the session credentials.
pub type Authenticator = Arc<dyn Fn() -> PasswordAuthentication + Send + Sync>;

/// Protocol properties plus credentials for one configured connection.
///
/// Properties use the `mail.<protocol>.<name>` keys of [`PropertyKey`].
#[derive(Clone)]
pub struct Session {
    protocol: Protocol,
    properties: BTreeMap<String, String>,
    authenticator: Authenticator,
}

impl Session {
    /// The session protocol.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// All properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Raw property lookup.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Looks up a templated property for this session's protocol.
    #[must_use]
    pub fn get(&self, key: PropertyKey) -> Option<&str> {
        self.property(&self.protocol.key(key))
    }

    /// Returns true if the property is set to `true`.
    #[must_use]
    pub fn flag(&self, key: PropertyKey) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Reads a millisecond timeout property.
    #[must_use]
    pub fn timeout(&self, key: PropertyKey) -> Option<Duration> {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
    }

    /// Splits a space-separated list property.
    #[must_use]
    pub fn list(&self, key: PropertyKey) -> Vec<&str> {
        self.get(key)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Server host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.get(PropertyKey::Host).unwrap_or_default()
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.get(PropertyKey::Port)
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| self.protocol.default_port())
    }

    /// Whether the connection starts plain and upgrades with STARTTLS.
    #[must_use]
    pub fn uses_starttls(&self) -> bool {
        self.flag(PropertyKey::StartTlsEnable)
    }

    /// Whether the connection is TLS from the start.
    #[must_use]
    pub fn uses_implicit_tls(&self) -> bool {
        self.flag(PropertyKey::SslEnable)
    }

    /// Invokes the credential callback.
    #[must_use]
    pub fn authentication(&self) -> PasswordAuthentication {
        (self.authenticator)()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Builds a session from configuration.
///
/// Secure protocols get either STARTTLS (`require_tls`) or implicit TLS
/// properties, plus any cipher, protocol and trust lists. Comma-separated
/// lists are stored space-separated. Timeouts are only set when configured.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for a missing host or zero port and
/// [`Error::AuthenticationSetup`] when no username is configured.
pub fn create_session(config: &ConnectionConfig) -> Result<Session> {
    if config.host.trim().is_empty() {
        return Err(Error::Configuration("host is required".into()));
    }
    if config.port == 0 {
        return Err(Error::Configuration("port must be non-zero".into()));
    }
    if config.credentials.username.is_empty() {
        return Err(Error::AuthenticationSetup(format!(
            "no username configured for connection '{}'",
            config.connection_name
        )));
    }

    let protocol = config.protocol;
    let mut properties = BTreeMap::new();
    let mut set = |key: PropertyKey, value: String| {
        properties.insert(protocol.key(key), value);
    };

    set(PropertyKey::Host, config.host.clone());
    set(PropertyKey::Port, config.port.to_string());
    set(PropertyKey::Auth, "true".into());

    if protocol.is_secure() {
        let tls = &config.tls;
        if tls.require_tls {
            set(PropertyKey::StartTlsEnable, "true".into());
        } else {
            set(PropertyKey::SslEnable, "true".into());
            set(PropertyKey::SocketFactoryFallback, "false".into());
            set(PropertyKey::SocketFactoryPort, config.port.to_string());
        }

        let lists = [
            (PropertyKey::SslCipherSuites, &tls.cipher_suites),
            (PropertyKey::SslProtocols, &tls.ssl_protocols),
            (PropertyKey::SslTrust, &tls.trusted_hosts),
        ];
        for (key, value) in lists {
            if let Some(list) = value.as_deref().and_then(normalize_list) {
                set(key, list);
            }
        }

        if tls.check_server_identity {
            set(PropertyKey::SslCheckServerIdentity, "true".into());
        }
    }

    let timeouts = [
        (PropertyKey::Timeout, config.timeouts.read_timeout),
        (PropertyKey::WriteTimeout, config.timeouts.write_timeout),
        (PropertyKey::ConnectionTimeout, config.timeouts.connect_timeout),
    ];
    for (key, timeout) in timeouts {
        if let Some(timeout) = timeout {
            set(key, timeout.as_millis().to_string());
        }
    }

    properties.insert(TRANSPORT_PROTOCOL.to_string(), protocol.name().to_string());

    let credentials = PasswordAuthentication {
        username: config.credentials.username.clone(),
        password: config.credentials.password.clone(),
    };
    let authenticator: Authenticator = Arc::new(move || credentials.clone());

    debug!(
        connection = %config.connection_name,
        %protocol,
        host = %config.host,
        port = config.port,
        "created mail session"
    );

    Ok(Session {
        protocol,
        properties,
        authenticator,
    })
}

/// Converts a comma-separated list to a space-separated one, dropping blank
/// entries. Returns `None` when nothing remains.
#[must_use]
pub fn normalize_list(value: &str) -> Option<String> {
    let items: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then(|| items.join(" "))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn builder(protocol: Protocol) -> crate::config::ConnectionConfigBuilder {
        ConnectionConfig::builder("test", "mail.example.com", 993, protocol)
            .credentials("user", "pw")
    }

    #[test]
    fn test_base_properties() {
        let session = create_session(&builder(Protocol::Imap).build()).unwrap();
        assert_eq!(session.property("mail.imap.host"), Some("mail.example.com"));
        assert_eq!(session.property("mail.imap.port"), Some("993"));
        assert_eq!(session.property("mail.imap.auth"), Some("true"));
        assert_eq!(session.property("mail.transport.protocol"), Some("imap"));
        assert!(session.get(PropertyKey::SslEnable).is_none());
        assert!(session.get(PropertyKey::Timeout).is_none());
        assert_eq!(session.host(), "mail.example.com");
        assert_eq!(session.port(), 993);
    }

    #[test]
    fn test_implicit_tls_properties() {
        let config = builder(Protocol::Imaps)
            .cipher_suites("TLS13_AES_256_GCM_SHA384, ,TLS13_CHACHA20_POLY1305_SHA256")
            .ssl_protocols("TLSv1.3")
            .trusted_hosts("*")
            .build();
        let session = create_session(&config).unwrap();

        assert!(session.uses_implicit_tls());
        assert!(!session.uses_starttls());
        assert_eq!(session.property("mail.imap.socketFactory.fallback"), Some("false"));
        assert_eq!(session.property("mail.imap.socketFactory.port"), Some("993"));
        assert_eq!(
            session.property("mail.imap.ssl.ciphersuites"),
            Some("TLS13_AES_256_GCM_SHA384 TLS13_CHACHA20_POLY1305_SHA256")
        );
        assert_eq!(session.list(PropertyKey::SslProtocols), vec!["TLSv1.3"]);
        assert_eq!(session.property("mail.imap.ssl.trust"), Some("*"));
        assert!(session.get(PropertyKey::SslCheckServerIdentity).is_none());
    }

    #[test]
    fn test_starttls_properties() {
        let config = builder(Protocol::Smtps)
            .require_tls(true)
            .check_server_identity(true)
            .build();
        let session = create_session(&config).unwrap();

        assert!(session.uses_starttls());
        assert!(!session.uses_implicit_tls());
        assert!(session.get(PropertyKey::SocketFactoryPort).is_none());
        assert_eq!(
            session.property("mail.smtp.ssl.checkserveridentity"),
            Some("true")
        );
        assert_eq!(session.property("mail.transport.protocol"), Some("smtp"));
    }

    #[test]
    fn test_plain_protocol_ignores_tls_options() {
        let config = builder(Protocol::Pop3).require_tls(true).trusted_hosts("a").build();
        let session = create_session(&config).unwrap();
        assert!(session.get(PropertyKey::StartTlsEnable).is_none());
        assert!(session.get(PropertyKey::SslTrust).is_none());
    }

    #[test]
    fn test_timeouts() {
        let config = builder(Protocol::Imap)
            .read_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_millis(1500))
            .build();
        let session = create_session(&config).unwrap();
        assert_eq!(session.property("mail.imap.timeout"), Some("30000"));
        assert_eq!(session.property("mail.imap.connectiontimeout"), Some("1500"));
        assert!(session.get(PropertyKey::WriteTimeout).is_none());
        assert_eq!(
            session.timeout(PropertyKey::ConnectionTimeout),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_authenticator_returns_configured_credentials() {
        let session = create_session(&builder(Protocol::Imap).build()).unwrap();
        let auth = session.authentication();
        assert_eq!(auth.username(), "user");
        assert_eq!(auth.password(), "pw");
        assert!(!format!("{auth:?}").contains("pw\""));
    }

    #[test]
    fn test_errors() {
        let no_user = ConnectionConfig::builder("t", "h", 1, Protocol::Imap).build();
        assert!(matches!(
            create_session(&no_user),
            Err(Error::AuthenticationSetup(_))
        ));

        let no_host = ConnectionConfig::builder("t", "", 1, Protocol::Imap)
            .credentials("u", "p")
            .build();
        assert!(matches!(create_session(&no_host), Err(Error::Configuration(_))));

        let no_port = ConnectionConfig::builder("t", "h", 0, Protocol::Imap)
            .credentials("u", "p")
            .build();
        assert!(matches!(create_session(&no_port), Err(Error::Configuration(_))));
    }

    proptest! {
        #[test]
        fn normalized_lists_are_space_separated(items in prop::collection::vec("[A-Za-z0-9_.]{1,12}", 1..8)) {
            let raw = items.join(" , ");
            let normalized = normalize_list(&raw).unwrap();
            prop_assert!(!normalized.contains(','));
            prop_assert_eq!(normalized.split(' ').collect::<Vec<_>>(), items.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_normalize_blank_list() {
        assert_eq!(normalize_list(" , ,"), None);
        assert_eq!(normalize_list("a"), Some("a".to_string()));
    }
}
