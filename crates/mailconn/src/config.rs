//! Connection and mailbox query configuration.
//!
//! Configuration arrives as one flat camelCase record (see
//! [`ConnectionConfig::from_json`]) or is assembled with
//! [`ConnectionConfig::builder`]. Durations are expressed in milliseconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::protocol::Protocol;
use crate::{Error, Result};

/// Folder opened when none is named.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Everything needed to reach and authenticate against one mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Registry key for this connection.
    pub connection_name: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Protocol spoken on the connection.
    pub protocol: Protocol,
    /// Login credentials.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Socket timeouts.
    #[serde(flatten)]
    pub timeouts: Timeouts,
    /// TLS negotiation options.
    #[serde(flatten)]
    pub tls: TlsOptions,
    /// Pool sizing and exhaustion policy.
    #[serde(flatten)]
    pub pool: PoolConfig,
    /// Hand out fresh connections instead of reusing idle ones.
    #[serde(default)]
    pub disable_pooling: bool,
}

impl ConnectionConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(
        connection_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(connection_name, host, port, protocol)
    }

    /// Parses a configuration record from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the JSON is malformed or fails
    /// validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid connection config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks required parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        if self.connection_name.trim().is_empty() {
            return Err(Error::Configuration("connectionName is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("host is required".into()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("port must be non-zero".into()));
        }
        if self.pool.max_active == 0 {
            return Err(Error::Configuration("maxActive must be at least 1".into()));
        }
        if self.pool.max_active > Semaphore::MAX_PERMITS {
            return Err(Error::Configuration(format!(
                "maxActive must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Username and password.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Socket timeouts. Unset means the transport default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Read timeout.
    #[serde(with = "millis")]
    pub read_timeout: Option<Duration>,
    /// Write timeout.
    #[serde(with = "millis")]
    pub write_timeout: Option<Duration>,
    /// Connect timeout.
    #[serde(with = "millis", rename = "connectionTimeout")]
    pub connect_timeout: Option<Duration>,
}

/// TLS negotiation options. Only consulted for secure protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// Upgrade a plain connection with STARTTLS instead of connecting over
    /// TLS.
    pub require_tls: bool,
    /// Reject certificates issued for a different host name.
    ///
    /// Off by default. While off, a certificate that chains to a trusted root
    /// but was issued for another host is accepted, so any holder of a valid
    /// certificate can impersonate the server. Enable it for connections
    /// crossing untrusted networks.
    pub check_server_identity: bool,
    /// Comma-separated hosts trusted without certificate validation, or `*`.
    pub trusted_hosts: Option<String>,
    /// Comma-separated cipher suite names.
    pub cipher_suites: Option<String>,
    /// Comma-separated TLS protocol versions.
    pub ssl_protocols: Option<String>,
}

/// What a borrow does when every pooled connection is in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExhaustedAction {
    /// Fail immediately.
    Fail,
    /// Wait for a connection to be returned, up to `max_wait` if set.
    #[default]
    Block,
    /// Create a connection beyond `max_active`.
    Grow,
}

impl ExhaustedAction {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "FAIL",
            Self::Block => "BLOCK",
            Self::Grow => "GROW",
        }
    }
}

impl fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExhaustedAction {
    type Err = Error;

    /// Accepts `FAIL`, `BLOCK` and `GROW`, with or without the legacy
    /// `WHEN_EXHAUSTED_` prefix, in any case.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("WHEN_EXHAUSTED_").unwrap_or(&upper) {
            "FAIL" => Ok(Self::Fail),
            "BLOCK" => Ok(Self::Block),
            "GROW" => Ok(Self::Grow),
            _ => Err(Error::Configuration(format!(
                "Unknown exhausted action: {s}"
            ))),
        }
    }
}

impl TryFrom<String> for ExhaustedAction {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExhaustedAction> for String {
    fn from(action: ExhaustedAction) -> Self {
        action.as_str().to_string()
    }
}

/// Pool sizing, eviction and exhaustion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Most connections borrowed at once.
    pub max_active: usize,
    /// Most idle connections kept for reuse.
    pub max_idle: usize,
    /// Longest a blocked borrow waits. Unset or zero waits indefinitely.
    #[serde(with = "millis")]
    pub max_wait: Option<Duration>,
    /// Idle time after which the evictor destroys a connection.
    #[serde(with = "millis")]
    pub min_eviction_idle_time: Option<Duration>,
    /// How often the evictor runs.
    #[serde(with = "millis")]
    pub eviction_check_interval: Option<Duration>,
    /// Behaviour when every connection is borrowed.
    pub exhausted_action: ExhaustedAction,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 4,
            max_idle: 2,
            max_wait: None,
            min_eviction_idle_time: None,
            eviction_check_interval: None,
            exhausted_action: ExhaustedAction::Block,
        }
    }
}

impl PoolConfig {
    /// Returns the eviction interval and idle threshold when both are set
    /// and non-zero.
    #[must_use]
    pub fn eviction(&self) -> Option<(Duration, Duration)> {
        self.eviction_check_interval
            .zip(self.min_eviction_idle_time)
            .filter(|(interval, min_idle)| !interval.is_zero() && !min_idle.is_zero())
    }

    /// Returns the blocking wait limit, treating zero as unbounded.
    #[must_use]
    pub fn wait_limit(&self) -> Option<Duration> {
        self.max_wait.filter(|limit| !limit.is_zero())
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Creates a builder with default pool settings.
    #[must_use]
    pub fn new(
        connection_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            config: ConnectionConfig {
                connection_name: connection_name.into(),
                host: host.into(),
                port,
                protocol,
                credentials: Credentials::default(),
                timeouts: Timeouts::default(),
                tls: TlsOptions::default(),
                pool: PoolConfig::default(),
                disable_pooling: false,
            },
        }
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Credentials::new(username, password);
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.read_timeout = Some(timeout);
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.write_timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.connect_timeout = Some(timeout);
        self
    }

    /// Uses STARTTLS instead of implicit TLS for secure protocols.
    #[must_use]
    pub const fn require_tls(mut self, require: bool) -> Self {
        self.config.tls.require_tls = require;
        self
    }

    /// Rejects certificates issued for another host name.
    #[must_use]
    pub const fn check_server_identity(mut self, check: bool) -> Self {
        self.config.tls.check_server_identity = check;
        self
    }

    /// Sets the comma-separated trusted hosts.
    #[must_use]
    pub fn trusted_hosts(mut self, hosts: impl Into<String>) -> Self {
        self.config.tls.trusted_hosts = Some(hosts.into());
        self
    }

    /// Sets the comma-separated cipher suites.
    #[must_use]
    pub fn cipher_suites(mut self, suites: impl Into<String>) -> Self {
        self.config.tls.cipher_suites = Some(suites.into());
        self
    }

    /// Sets the comma-separated TLS protocol versions.
    #[must_use]
    pub fn ssl_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.config.tls.ssl_protocols = Some(protocols.into());
        self
    }

    /// Sets the maximum number of borrowed connections.
    #[must_use]
    pub const fn max_active(mut self, max_active: usize) -> Self {
        self.config.pool.max_active = max_active;
        self
    }

    /// Sets the maximum number of idle connections.
    #[must_use]
    pub const fn max_idle(mut self, max_idle: usize) -> Self {
        self.config.pool.max_idle = max_idle;
        self
    }

    /// Sets the longest a blocked borrow waits. Zero waits indefinitely.
    #[must_use]
    pub const fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.pool.max_wait = non_zero(max_wait);
        self
    }

    /// Enables idle eviction. A zero interval or idle time leaves it off.
    #[must_use]
    pub const fn eviction(mut self, check_interval: Duration, min_idle_time: Duration) -> Self {
        self.config.pool.eviction_check_interval = non_zero(check_interval);
        self.config.pool.min_eviction_idle_time = non_zero(min_idle_time);
        self
    }

    /// Sets the exhaustion policy.
    #[must_use]
    pub const fn exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.config.pool.exhausted_action = action;
        self
    }

    /// Disables reuse of idle connections.
    #[must_use]
    pub const fn disable_pooling(mut self, disable: bool) -> Self {
        self.config.disable_pooling = disable;
        self
    }

    /// Builds the configuration without validating it.
    #[must_use]
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

const fn non_zero(duration: Duration) -> Option<Duration> {
    if duration.is_zero() { None } else { Some(duration) }
}

/// Which messages to list from a folder and how to page them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MailboxQuery {
    /// Folder to read.
    pub folder: String,
    /// Delete listed messages once they have been read.
    pub delete_after_retrieve: bool,
    /// Match the `\Seen` flag.
    pub seen: Option<bool>,
    /// Match the `\Answered` flag.
    pub answered: Option<bool>,
    /// Match the `\Recent` flag.
    pub recent: Option<bool>,
    /// Match the `\Deleted` flag.
    pub deleted: Option<bool>,
    /// Received strictly after.
    pub received_since: Option<DateTime<Utc>>,
    /// Received before.
    pub received_until: Option<DateTime<Utc>>,
    /// Sent strictly after.
    pub sent_since: Option<DateTime<Utc>>,
    /// Sent before.
    pub sent_until: Option<DateTime<Utc>>,
    /// Regular expression the subject must match.
    pub subject_regex: Option<String>,
    /// Regular expression the From address must match.
    pub from_regex: Option<String>,
    /// Matches to skip.
    pub offset: usize,
    /// Most messages to return.
    pub limit: usize,
}

impl Default for MailboxQuery {
    fn default() -> Self {
        Self {
            folder: DEFAULT_FOLDER.to_string(),
            delete_after_retrieve: false,
            seen: None,
            answered: None,
            recent: None,
            deleted: None,
            received_since: None,
            received_until: None,
            sent_since: None,
            sent_until: None,
            subject_regex: None,
            from_regex: None,
            offset: 0,
            limit: 10,
        }
    }
}

impl MailboxQuery {
    /// Creates a query for a folder with default paging.
    #[must_use]
    pub fn for_folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Sets the page.
    #[must_use]
    pub const fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// Serde adapter for `Option<Duration>` as integer milliseconds. Zero reads
/// as unset.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "connectionName": "support-inbox",
        "host": "imap.example.com",
        "port": 993,
        "protocol": "IMAPS",
        "username": "support",
        "password": "s3cret",
        "readTimeout": 30000,
        "connectionTimeout": 5000,
        "checkServerIdentity": true,
        "trustedHosts": "imap.example.com, backup.example.com",
        "maxActive": 8,
        "maxWait": 250,
        "exhaustedAction": "WHEN_EXHAUSTED_FAIL"
    }"#;

    #[test]
    fn test_from_json() {
        let config = ConnectionConfig::from_json(JSON).unwrap();
        assert_eq!(config.connection_name, "support-inbox");
        assert_eq!(config.protocol, Protocol::Imaps);
        assert_eq!(config.credentials.username, "support");
        assert_eq!(config.timeouts.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.timeouts.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.timeouts.write_timeout, None);
        assert!(config.tls.check_server_identity);
        assert!(!config.tls.require_tls);
        assert_eq!(config.pool.max_active, 8);
        assert_eq!(config.pool.max_idle, 2);
        assert_eq!(config.pool.max_wait, Some(Duration::from_millis(250)));
        assert_eq!(config.pool.exhausted_action, ExhaustedAction::Fail);
        assert!(!config.disable_pooling);
    }

    #[test]
    fn test_from_json_rejects_bad_action() {
        let json = JSON.replace("WHEN_EXHAUSTED_FAIL", "WHEN_EXHAUSTED_PANIC");
        let err = ConnectionConfig::from_json(&json).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_json_validates() {
        let json = JSON.replace("\"port\": 993", "\"port\": 0");
        assert!(ConnectionConfig::from_json(&json).is_err());
        assert!(ConnectionConfig::from_json("{").is_err());
    }

    #[test]
    fn test_exhausted_action_names() {
        assert_eq!("fail".parse::<ExhaustedAction>().unwrap(), ExhaustedAction::Fail);
        assert_eq!("BLOCK".parse::<ExhaustedAction>().unwrap(), ExhaustedAction::Block);
        assert_eq!(
            "when_exhausted_grow".parse::<ExhaustedAction>().unwrap(),
            ExhaustedAction::Grow
        );
        assert!("WHEN_EXHAUSTED_".parse::<ExhaustedAction>().is_err());
        assert!("".parse::<ExhaustedAction>().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let config = ConnectionConfig::builder("out", "smtp.example.com", 587, Protocol::Smtp)
            .credentials("me", "pw")
            .build();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.pool.max_active, 4);
        assert_eq!(config.pool.exhausted_action, ExhaustedAction::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let base = ConnectionConfig::builder("n", "h", 1, Protocol::Imap);
        assert!(base.clone().build().validate().is_ok());
        assert!(ConnectionConfig::builder("", "h", 1, Protocol::Imap).build().validate().is_err());
        assert!(ConnectionConfig::builder("n", " ", 1, Protocol::Imap).build().validate().is_err());
        assert!(base.max_active(0).build().validate().is_err());
    }

    #[test]
    fn test_zero_durations_are_unset() {
        let json = r#"{
            "connectionName": "n", "host": "h", "port": 143, "protocol": "IMAP",
            "maxActive": 1, "maxWait": 0, "exhaustedAction": "BLOCK",
            "minEvictionIdleTime": 0, "evictionCheckInterval": 0, "readTimeout": 0
        }"#;
        let config = ConnectionConfig::from_json(json).unwrap();
        assert_eq!(config.pool.max_wait, None);
        assert_eq!(config.pool.min_eviction_idle_time, None);
        assert_eq!(config.pool.eviction_check_interval, None);
        assert_eq!(config.timeouts.read_timeout, None);
        assert!(config.pool.eviction().is_none());

        let built = ConnectionConfig::builder("n", "h", 1, Protocol::Imap)
            .max_wait(Duration::ZERO)
            .eviction(Duration::from_secs(1), Duration::ZERO)
            .build();
        assert_eq!(built.pool.max_wait, None);
        assert!(built.pool.eviction().is_none());

        let pool = PoolConfig {
            max_wait: Some(Duration::ZERO),
            min_eviction_idle_time: Some(Duration::ZERO),
            eviction_check_interval: Some(Duration::from_secs(1)),
            ..PoolConfig::default()
        };
        assert_eq!(pool.wait_limit(), None);
        assert!(pool.eviction().is_none());
    }

    #[test]
    fn test_validate_rejects_oversized_pool() {
        let config = ConnectionConfig::builder("n", "h", 1, Protocol::Imap)
            .max_active(Semaphore::MAX_PERMITS + 1)
            .build();
        let err = config.validate().unwrap_err();
        assert!(matches!(&err, Error::Configuration(msg) if msg.contains("maxActive")));
        assert!(
            ConnectionConfig::builder("n", "h", 1, Protocol::Imap)
                .max_active(Semaphore::MAX_PERMITS)
                .build()
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_eviction_requires_both_settings() {
        let mut pool = PoolConfig::default();
        assert!(pool.eviction().is_none());
        pool.eviction_check_interval = Some(Duration::from_secs(1));
        assert!(pool.eviction().is_none());
        pool.min_eviction_idle_time = Some(Duration::from_secs(5));
        assert_eq!(
            pool.eviction(),
            Some((Duration::from_secs(1), Duration::from_secs(5)))
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_mailbox_query_defaults() {
        let query: MailboxQuery = serde_json::from_str(r#"{"subjectRegex": "^Invoice"}"#).unwrap();
        assert_eq!(query.folder, "INBOX");
        assert_eq!(query.offset, 0);
        assert_eq!(query.limit, 10);
        assert_eq!(query.subject_regex.as_deref(), Some("^Invoice"));

        let query = MailboxQuery::for_folder("Archive").page(20, 5);
        assert_eq!((query.folder.as_str(), query.offset, query.limit), ("Archive", 20, 5));
    }
}
