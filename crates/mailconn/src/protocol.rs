//! Mail protocol descriptors and session property keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A mail access or submission protocol.
///
/// Plain and secure variants share a base name, which is what property keys
/// are templated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    /// SMTP, optionally upgraded with STARTTLS.
    Smtp,
    /// SMTP over TLS.
    Smtps,
    /// IMAP, optionally upgraded with STARTTLS.
    Imap,
    /// IMAP over TLS.
    Imaps,
    /// POP3, optionally upgraded with STARTTLS.
    Pop3,
    /// POP3 over TLS.
    Pop3s,
}

impl Protocol {
    /// All protocols.
    pub const ALL: [Self; 6] = [
        Self::Smtp,
        Self::Smtps,
        Self::Imap,
        Self::Imaps,
        Self::Pop3,
        Self::Pop3s,
    ];

    /// Base protocol name used in property keys.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Smtp | Self::Smtps => "smtp",
            Self::Imap | Self::Imaps => "imap",
            Self::Pop3 | Self::Pop3s => "pop3",
        }
    }

    /// Identifier of this exact variant, e.g. `imaps`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Smtps => "smtps",
            Self::Imap => "imap",
            Self::Imaps => "imaps",
            Self::Pop3 => "pop3",
            Self::Pop3s => "pop3s",
        }
    }

    /// Whether sessions for this protocol negotiate TLS.
    #[must_use]
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Smtps | Self::Imaps | Self::Pop3s)
    }

    /// Whether this protocol only submits mail and has no mailbox state.
    #[must_use]
    pub const fn is_send_only(self) -> bool {
        matches!(self, Self::Smtp | Self::Smtps)
    }

    /// Conventional port for the protocol.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Smtp => 25,
            Self::Smtps => 465,
            Self::Imap => 143,
            Self::Imaps => 993,
            Self::Pop3 => 110,
            Self::Pop3s => 995,
        }
    }

    /// Renders a property key for this protocol.
    #[must_use]
    pub fn key(self, key: PropertyKey) -> String {
        key.template().replace("%s", self.name())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Configuration(format!("Unknown protocol: {s}")))
    }
}

impl TryFrom<String> for Protocol {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

/// Session property keys.
///
/// Templates contain `%s`, replaced by [`Protocol::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    /// Server host.
    Host,
    /// Server port.
    Port,
    /// Whether to authenticate.
    Auth,
    /// Upgrade a plain connection with STARTTLS.
    StartTlsEnable,
    /// Connect with TLS from the start.
    SslEnable,
    /// Fall back to a plain socket when TLS fails.
    SocketFactoryFallback,
    /// Port the TLS socket connects to.
    SocketFactoryPort,
    /// Space-separated cipher suite names.
    SslCipherSuites,
    /// Space-separated TLS protocol versions.
    SslProtocols,
    /// Space-separated hosts whose certificates are trusted without
    /// validation, or `*`.
    SslTrust,
    /// Verify the certificate matches the host name.
    SslCheckServerIdentity,
    /// Read timeout in milliseconds.
    Timeout,
    /// Connect timeout in milliseconds.
    ConnectionTimeout,
    /// Write timeout in milliseconds.
    WriteTimeout,
}

impl PropertyKey {
    /// The key template.
    #[must_use]
    pub const fn template(self) -> &'static str {
        match self {
            Self::Host => "mail.%s.host",
            Self::Port => "mail.%s.port",
            Self::Auth => "mail.%s.auth",
            Self::StartTlsEnable => "mail.%s.starttls.enable",
            Self::SslEnable => "mail.%s.ssl.enable",
            Self::SocketFactoryFallback => "mail.%s.socketFactory.fallback",
            Self::SocketFactoryPort => "mail.%s.socketFactory.port",
            Self::SslCipherSuites => "mail.%s.ssl.ciphersuites",
            Self::SslProtocols => "mail.%s.ssl.protocols",
            Self::SslTrust => "mail.%s.ssl.trust",
            Self::SslCheckServerIdentity => "mail.%s.ssl.checkserveridentity",
            Self::Timeout => "mail.%s.timeout",
            Self::ConnectionTimeout => "mail.%s.connectiontimeout",
            Self::WriteTimeout => "mail.%s.writetimeout",
        }
    }
}

/// Property naming the transport protocol of a session. Not templated.
pub const TRANSPORT_PROTOCOL: &str = "mail.transport.protocol";
