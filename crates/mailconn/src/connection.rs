//! A configured session bound to its transport.

use std::fmt;
use std::sync::Arc;

use mailconn_mime::OutgoingMessage;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::session::{Session, create_session};
use crate::transport::Transport;
use crate::{Error, Result};

/// Anything backed by a mail session.
pub trait MailConnection {
    /// The underlying session.
    fn session(&self) -> &Arc<Session>;

    /// Whether the session's protocol negotiates TLS.
    fn is_secure_protocol(&self) -> bool {
        self.session().protocol().is_secure()
    }
}

/// A session plus the transport that speaks its protocol.
///
/// Send-only protocols use a `Connection` directly; stateful protocols wrap
/// one in a [`MailboxConnection`](crate::MailboxConnection).
#[derive(Clone)]
pub struct Connection {
    name: String,
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
}

impl Connection {
    /// Creates a connection from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be built.
    pub fn new(config: &ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let session = create_session(config)?;
        Ok(Self {
            name: config.connection_name.clone(),
            session: Arc::new(session),
            transport,
        })
    }

    /// Connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Submits a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the protocol cannot send or the
    /// message has no recipients, and [`Error::ConnectionFailure`] if the
    /// transport rejects it.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let protocol = self.session.protocol();
        if !protocol.is_send_only() {
            return Err(Error::Configuration(format!(
                "Connection '{}' uses {protocol}, which cannot send mail",
                self.name
            )));
        }
        if message.recipients.is_empty() {
            return Err(Error::Configuration("Message has no recipients".into()));
        }

        self.transport
            .send(&self.session, message)
            .await
            .map_err(|e| Error::connection(format!("send via '{}'", self.name), e))?;
        debug!(
            connection = %self.name,
            recipients = message.recipients.len(),
            "message sent"
        );
        Ok(())
    }
}

impl MailConnection for Connection {
    fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
