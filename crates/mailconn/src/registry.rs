//! Named connections and pools created from configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{error, info};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::factory::{ConnectionPool, MailboxConnectionFactory};
use crate::pool::Pool;
use crate::transport::Transport;
use crate::{Error, Result};

static GLOBAL: OnceLock<ConnectionRegistry> = OnceLock::new();

/// A pool that did not close cleanly during
/// [`ConnectionRegistry::clear_connection_pools`].
#[derive(Debug)]
pub struct PoolCloseFailure {
    /// Connection name of the pool.
    pub name: String,
    /// What went wrong.
    pub error: Error,
}

/// Send-only connections and mailbox pools, keyed by connection name.
///
/// The first configuration registered under a name wins; later ones are
/// ignored.
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose connections use `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Initializes the process-wide registry. Later calls return the
    /// existing instance and ignore `transport`.
    pub fn init_global(transport: Arc<dyn Transport>) -> &'static Self {
        GLOBAL.get_or_init(|| Self::new(transport))
    }

    /// The process-wide registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before [`Self::init_global`].
    pub fn global() -> Result<&'static Self> {
        GLOBAL
            .get()
            .ok_or_else(|| Error::NotInitialized("global connection registry".into()))
    }

    /// Registers a connection (send-only protocols) or a pool (everything
    /// else) unless the name is already bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] or [`Error::AuthenticationSetup`] if
    /// the configuration is invalid.
    pub fn create_connection(&self, config: &ConnectionConfig) -> Result<()> {
        config.validate()?;
        let name = &config.connection_name;

        if config.protocol.is_send_only() {
            if read(&self.connections).contains_key(name) {
                return Ok(());
            }
            let mut connections = write(&self.connections);
            if !connections.contains_key(name) {
                let connection = Connection::new(config, Arc::clone(&self.transport))?;
                connections.insert(name.clone(), Arc::new(connection));
                info!(connection = %name, protocol = %config.protocol, "registered connection");
            }
        } else {
            if read(&self.pools).contains_key(name) {
                return Ok(());
            }
            let mut pools = write(&self.pools);
            if !pools.contains_key(name) {
                let connection = Connection::new(config, Arc::clone(&self.transport))?;
                let mut pool_config = config.pool;
                if config.disable_pooling {
                    pool_config.max_idle = 0;
                }
                let pool = Pool::new(
                    name.clone(),
                    pool_config,
                    MailboxConnectionFactory::new(connection),
                );
                pools.insert(name.clone(), Arc::new(pool));
                info!(
                    connection = %name,
                    protocol = %config.protocol,
                    max_active = pool_config.max_active,
                    max_idle = pool_config.max_idle,
                    "registered connection pool"
                );
            }
        }
        Ok(())
    }

    /// Looks up a send-only connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if none is registered under `name`.
    pub fn get_connection(&self, name: &str) -> Result<Arc<Connection>> {
        read(&self.connections)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotInitialized(name.to_string()))
    }

    /// Looks up a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if none is registered under `name`.
    pub fn get_connection_pool(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        read(&self.pools)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotInitialized(name.to_string()))
    }

    /// Closes and removes every pool. Failures are logged and returned; the
    /// sweep always visits every pool.
    pub async fn clear_connection_pools(&self) -> Vec<PoolCloseFailure> {
        let pools: Vec<(String, Arc<ConnectionPool>)> = write(&self.pools).drain().collect();
        let mut failures = Vec::new();
        for (name, pool) in pools {
            if let Err(e) = pool.close().await {
                error!(connection = %name, error = %e, "failed to close connection pool");
                failures.push(PoolCloseFailure { name, error: e });
            }
        }
        failures
    }

    /// Names of registered send-only connections, sorted.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        sorted_keys(&read(&self.connections))
    }

    /// Names of registered pools, sorted.
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        sorted_keys(&read(&self.pools))
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connection_names())
            .field("pools", &self.pool_names())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::Protocol;
    use crate::transport::memory::MemoryServer;

    fn config(name: &str, protocol: Protocol) -> ConnectionConfig {
        ConnectionConfig::builder(name, "mail.example.com", 1025, protocol)
            .credentials("alice", "pw")
            .build()
    }

    #[tokio::test]
    async fn test_send_only_connection_is_shared() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        registry.create_connection(&config("out", Protocol::Smtp)).unwrap();
        let first = registry.get_connection("out").unwrap();
        registry.create_connection(&config("out", Protocol::Smtp)).unwrap();
        let second = registry.get_connection("out").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.connection_names(), vec!["out"]);
        assert!(registry.pool_names().is_empty());
    }

    #[tokio::test]
    async fn test_stateful_protocols_get_pools() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        registry.create_connection(&config("b", Protocol::Pop3)).unwrap();
        registry.create_connection(&config("a", Protocol::Imaps)).unwrap();
        assert_eq!(registry.pool_names(), vec!["a", "b"]);

        let pool = registry.get_connection_pool("a").unwrap();
        assert_eq!(pool.name(), "a");
        assert!(Arc::ptr_eq(&pool, &registry.get_connection_pool("a").unwrap()));
        assert_eq!(
            registry.get_connection("a").unwrap_err().kind(),
            ErrorKind::NotInitialized
        );
    }

    #[tokio::test]
    async fn test_first_configuration_wins() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        let mut first = config("in", Protocol::Imap);
        first.pool.max_active = 2;
        let mut second = config("in", Protocol::Imap);
        second.pool.max_active = 9;
        registry.create_connection(&first).unwrap();
        registry.create_connection(&second).unwrap();
        assert_eq!(registry.get_connection_pool("in").unwrap().config().max_active, 2);
    }

    #[tokio::test]
    async fn test_disable_pooling_keeps_nothing_idle() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        let mut cfg = config("in", Protocol::Imap);
        cfg.disable_pooling = true;
        registry.create_connection(&cfg).unwrap();
        assert_eq!(registry.get_connection_pool("in").unwrap().config().max_idle, 0);
    }

    #[test]
    fn test_invalid_configuration() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        let err = registry.create_connection(&config("", Protocol::Imap)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let no_user = ConnectionConfig::builder("x", "h", 1, Protocol::Smtp).build();
        let err = registry.create_connection(&no_user).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationSetup);
        assert!(registry.connection_names().is_empty());
    }

    #[test]
    fn test_unknown_names() {
        let registry = ConnectionRegistry::new(MemoryServer::new().transport());
        assert!(matches!(registry.get_connection("x"), Err(Error::NotInitialized(_))));
        assert!(matches!(registry.get_connection_pool("x"), Err(Error::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_clear_connection_pools() {
        let server = MemoryServer::new();
        server.add_account("alice", "pw");
        let registry = ConnectionRegistry::new(server.transport());
        registry.create_connection(&config("a", Protocol::Imap)).unwrap();
        registry.create_connection(&config("b", Protocol::Imap)).unwrap();

        for name in ["a", "b"] {
            let pool = registry.get_connection_pool(name).unwrap();
            drop(pool.borrow().await.unwrap());
        }
        let a = registry.get_connection_pool("a").unwrap();

        server.set_fail_close(true);
        let failures = registry.clear_connection_pools().await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.error.kind() == ErrorKind::PoolClose));
        assert!(registry.pool_names().is_empty());
        assert!(a.is_closed());
        assert!(registry.clear_connection_pools().await.is_empty());
    }
}
