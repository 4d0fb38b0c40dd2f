//! Stateful mailbox connections and their folder state machine.
//!
//! A [`MailboxConnection`] owns one store handle and at most one open
//! folder. [`MailboxConnection::get_folder`] moves between folders:
//!
//! ```text
//! Closed ──open(name, mode)──▶ Open(name, mode)
//! Open(a, m) ──open(a, m)──▶ Open(a, m)          (no-op)
//! Open(a, m) ──open(b, n)──▶ close ▶ Open(b, n)
//! Open(_, _) ──close(expunge)──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::DEFAULT_FOLDER;
use crate::connection::{Connection, MailConnection};
use crate::flags::Flags;
use crate::search::SearchTerm;
use crate::session::Session;
use crate::transport::{FolderMode, MailFolder, MailStore, MessageRef, TransportError};
use crate::{Error, Result};

/// Where the folder state machine currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderStatus {
    /// No folder is open.
    Closed,
    /// The named folder is open read-only.
    OpenReadOnly(String),
    /// The named folder is open read-write.
    OpenReadWrite(String),
}

#[derive(Default)]
struct MailboxState {
    store: Option<Box<dyn MailStore>>,
    folder: Option<Box<dyn MailFolder>>,
}

/// A connection to a mail store with at most one open folder.
pub struct MailboxConnection {
    connection: Connection,
    state: Mutex<MailboxState>,
}

impl MailboxConnection {
    /// Opens the store and connects.
    ///
    /// Failures are logged and leave the connection disconnected, so a pool
    /// rejects it on validation.
    pub async fn open(connection: Connection) -> Self {
        let store = match connection
            .transport()
            .open_store(Arc::clone(connection.session()))
            .await
        {
            Ok(mut store) => {
                match store.connect().await {
                    Ok(()) => debug!(connection = %connection.name(), "store connected"),
                    Err(e) => {
                        warn!(connection = %connection.name(), error = %e, "failed to connect store");
                    }
                }
                Some(store)
            }
            Err(e) => {
                warn!(connection = %connection.name(), error = %e, "failed to open store");
                None
            }
        };

        Self {
            connection,
            state: Mutex::new(MailboxState {
                store,
                folder: None,
            }),
        }
    }

    /// Connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.connection.name()
    }

    /// The wrapped connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the store is connected.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        match &state.store {
            Some(store) => store.is_connected().await,
            None => false,
        }
    }

    /// Current folder state.
    pub async fn folder_status(&self) -> FolderStatus {
        let state = self.state.lock().await;
        match state.folder.as_deref() {
            Some(folder) if folder.is_open() => match folder.mode() {
                FolderMode::ReadOnly => FolderStatus::OpenReadOnly(folder.name().to_string()),
                FolderMode::ReadWrite => FolderStatus::OpenReadWrite(folder.name().to_string()),
            },
            _ => FolderStatus::Closed,
        }
    }

    /// Opens `name` in `mode`, reusing the current folder when it matches.
    ///
    /// Any other open folder is closed first without expunging. The returned
    /// guard holds this connection's lock until it is dropped or closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailure`] if the store is missing or the
    /// folder cannot be opened.
    pub async fn get_folder(&self, name: &str, mode: FolderMode) -> Result<OpenFolder<'_>> {
        let mut state = self.state.lock().await;

        let reusable = state
            .folder
            .as_deref()
            .is_some_and(|f| f.is_open() && f.mode() == mode && same_folder(f.name(), name));
        if reusable {
            return Ok(OpenFolder { state });
        }

        if let Some(mut current) = state.folder.take()
            && current.is_open()
            && let Err(e) = current.close(false).await
        {
            warn!(connection = %self.name(), folder = %current.name(), error = %e, "failed to close folder");
        }

        let context = format!("open folder '{name}'");
        let store = state
            .store
            .as_mut()
            .ok_or_else(|| Error::connection(context.clone(), TransportError::NotConnected))?;
        let folder = store
            .open_folder(name, mode)
            .await
            .map_err(|e| Error::connection(context, e))?;
        debug!(connection = %self.name(), folder = %name, ?mode, "folder opened");

        state.folder = Some(folder);
        Ok(OpenFolder { state })
    }

    /// Closes the open folder, if any. Errors are logged.
    pub async fn close_folder(&self, expunge: bool) {
        let mut state = self.state.lock().await;
        self.close_folder_locked(&mut state, expunge).await;
    }

    /// Closes the folder then the store. Both are attempted; failures are
    /// logged and the first one is returned. The connection cannot be used
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailure`] if the folder or store did not
    /// close cleanly.
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut failure = None;

        if let Some(mut folder) = state.folder.take()
            && folder.is_open()
            && let Err(e) = folder.close(false).await
        {
            warn!(connection = %self.name(), folder = %folder.name(), error = %e, "failed to close folder");
            failure = Some(Error::connection(format!("close folder '{}'", folder.name()), e));
        }
        if let Some(mut store) = state.store.take()
            && let Err(e) = store.close().await
        {
            warn!(connection = %self.name(), error = %e, "failed to close store");
            if failure.is_none() {
                failure = Some(Error::connection("close store", e));
            }
        }

        debug!(connection = %self.name(), "disconnected");
        failure.map_or(Ok(()), Err)
    }

    async fn close_folder_locked(&self, state: &mut MailboxState, expunge: bool) {
        if let Some(mut folder) = state.folder.take()
            && folder.is_open()
            && let Err(e) = folder.close(expunge).await
        {
            warn!(connection = %self.name(), folder = %folder.name(), error = %e, "failed to close folder");
        }
    }
}

impl MailConnection for MailboxConnection {
    fn session(&self) -> &Arc<Session> {
        self.connection.session()
    }
}

impl fmt::Debug for MailboxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxConnection")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// `INBOX` is case-insensitive; every other name is exact.
fn same_folder(a: &str, b: &str) -> bool {
    a == b || (a.eq_ignore_ascii_case(DEFAULT_FOLDER) && b.eq_ignore_ascii_case(DEFAULT_FOLDER))
}

/// An open folder, holding its connection's lock.
pub struct OpenFolder<'a> {
    state: MutexGuard<'a, MailboxState>,
}

impl OpenFolder<'_> {
    fn folder(&self) -> Result<&dyn MailFolder> {
        self.state
            .folder
            .as_deref()
            .ok_or_else(|| Error::Transport(TransportError::NotConnected))
    }

    fn folder_mut(&mut self) -> Result<&mut Box<dyn MailFolder>> {
        self.state
            .folder
            .as_mut()
            .ok_or_else(|| Error::Transport(TransportError::NotConnected))
    }

    /// Folder name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.state.folder.as_deref().map_or("", |f| f.name())
    }

    /// Mode the folder is open in.
    #[must_use]
    pub fn mode(&self) -> Option<FolderMode> {
        self.state.folder.as_deref().map(|f| f.mode())
    }

    /// Number of messages in the folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn message_count(&self) -> Result<usize> {
        Ok(self.folder()?.message_count().await?)
    }

    /// Finds matching messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn search(&self, term: &SearchTerm) -> Result<Vec<MessageRef>> {
        Ok(self.folder()?.search(term).await?)
    }

    /// Sets or clears flags on messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the folder is read-only.
    pub async fn set_flags(&mut self, messages: &[MessageRef], flags: &Flags, set: bool) -> Result<()> {
        self.folder_mut()?.set_flags(messages, flags, set).await?;
        Ok(())
    }

    /// Fetches a message's raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn fetch(&self, message: MessageRef) -> Result<Bytes> {
        Ok(self.folder()?.fetch(message).await?)
    }

    /// Closes the folder, optionally expunging deleted messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close the folder. The
    /// folder is considered closed either way.
    pub async fn close(mut self, expunge: bool) -> Result<()> {
        match self.state.folder.take() {
            Some(mut folder) if folder.is_open() => Ok(folder.close(expunge).await?),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for OpenFolder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFolder")
            .field("name", &self.name())
            .field("mode", &self.mode())
            .finish()
    }
}
