//! Pool factory for mailbox connections.

use async_trait::async_trait;
use tracing::debug;

use crate::connection::Connection;
use crate::mailbox::MailboxConnection;
use crate::pool::{Pool, PoolFactory};
use crate::Result;

/// Creates [`MailboxConnection`]s that share one configured [`Connection`].
#[derive(Debug, Clone)]
pub struct MailboxConnectionFactory {
    connection: Connection,
}

impl MailboxConnectionFactory {
    /// Creates a factory.
    #[must_use]
    pub const fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The shared connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl PoolFactory for MailboxConnectionFactory {
    type Item = MailboxConnection;

    async fn create(&self) -> Result<MailboxConnection> {
        debug!(connection = %self.connection.name(), "opening mailbox connection");
        Ok(MailboxConnection::open(self.connection.clone()).await)
    }

    async fn validate(&self, item: &MailboxConnection) -> bool {
        item.is_connected().await
    }

    async fn destroy(&self, item: MailboxConnection) -> Result<()> {
        item.disconnect().await
    }
}

/// Pool of mailbox connections for one configured name.
pub type ConnectionPool = Pool<MailboxConnectionFactory>;
