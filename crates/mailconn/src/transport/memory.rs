//! An in-process mail server and the [`Transport`] that talks to it.
//!
//! Accounts hold named folders of raw messages. SMTP sessions deliver to the
//! `INBOX` of every recipient that has an account; IMAP sessions see every
//! folder; POP3 sessions see only `INBOX`. The server can be taken offline
//! or made to drop existing connections, which is what pool validation
//! tests need.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mailconn_mime::OutgoingMessage;
use tracing::debug;

use super::{
    FolderMode, MailFolder, MailStore, MessageRef, Transport, TransportError, TransportResult,
};
use crate::config::DEFAULT_FOLDER;
use crate::flags::{Flag, Flags};
use crate::protocol::Protocol;
use crate::search::{HeaderSummary, MessageMeta, SearchTerm};
use crate::session::Session;

/// Counters describing what clients did to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful store logins.
    pub store_connects: usize,
    /// Folders opened.
    pub folder_opens: usize,
    /// Folders closed.
    pub folder_closes: usize,
    /// Expunge flag of the most recent folder close.
    pub last_close_expunge: Option<bool>,
    /// Messages accepted over SMTP.
    pub messages_sent: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Bytes,
    flags: Flags,
    received: DateTime<Utc>,
    headers: HeaderSummary,
}

impl StoredMessage {
    fn new(raw: Bytes, received: DateTime<Utc>) -> Self {
        Self {
            flags: Flags::single(Flag::Recent),
            received,
            headers: HeaderSummary::parse(&raw),
            raw,
        }
    }

    fn meta(&self) -> MessageMeta<'_> {
        self.headers.meta(&self.flags, Some(self.received))
    }
}

#[derive(Debug)]
struct Account {
    password: String,
    folders: BTreeMap<String, Vec<StoredMessage>>,
}

#[derive(Debug, Default)]
struct ServerState {
    accounts: HashMap<String, Account>,
    stats: MemoryStats,
}

impl ServerState {
    fn folder_mut(&mut self, user: &str, folder: &str) -> TransportResult<&mut Vec<StoredMessage>> {
        self.accounts
            .get_mut(user)
            .and_then(|a| a.folders.get_mut(folder))
            .ok_or_else(|| TransportError::FolderNotFound(folder.to_string()))
    }
}

#[derive(Debug, Default)]
struct ServerInner {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    generation: AtomicU64,
    fail_close: AtomicBool,
}

impl ServerInner {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// An in-process mail server.
///
/// Cloning shares the same server.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport connected to this server.
    #[must_use]
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            server: Arc::clone(&self.inner),
        })
    }

    /// Adds an account with an empty `INBOX`, replacing any existing one.
    pub fn add_account(&self, user: &str, password: &str) {
        let mut folders = BTreeMap::new();
        folders.insert(DEFAULT_FOLDER.to_string(), Vec::new());
        self.inner.lock().accounts.insert(
            user.to_string(),
            Account {
                password: password.to_string(),
                folders,
            },
        );
    }

    /// Creates a folder. Returns false if the account does not exist.
    pub fn create_folder(&self, user: &str, folder: &str) -> bool {
        self.inner
            .lock()
            .accounts
            .get_mut(user)
            .map(|a| a.folders.entry(folder.to_string()).or_default())
            .is_some()
    }

    /// Stores a message received now.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FolderNotFound`] if the account or folder
    /// does not exist.
    pub fn deliver(&self, user: &str, folder: &str, raw: impl Into<Bytes>) -> TransportResult<()> {
        self.deliver_at(user, folder, raw, Utc::now())
    }

    /// Stores a message with an explicit receive time.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FolderNotFound`] if the account or folder
    /// does not exist.
    pub fn deliver_at(
        &self,
        user: &str,
        folder: &str,
        raw: impl Into<Bytes>,
        received: DateTime<Utc>,
    ) -> TransportResult<()> {
        let message = StoredMessage::new(raw.into(), received);
        self.inner.lock().folder_mut(user, folder)?.push(message);
        Ok(())
    }

    /// Sets a flag on the message at `index` (zero-based). Returns false if
    /// there is no such message.
    pub fn flag_message(&self, user: &str, folder: &str, index: usize, flag: Flag) -> bool {
        let mut state = self.inner.lock();
        match state.folder_mut(user, folder) {
            Ok(messages) => messages.get_mut(index).map(|m| m.flags.insert(flag)).is_some(),
            Err(_) => false,
        }
    }

    /// Flags of every message in a folder, in order.
    #[must_use]
    pub fn folder_flags(&self, user: &str, folder: &str) -> Vec<Flags> {
        self.inner
            .lock()
            .folder_mut(user, folder)
            .map(|messages| messages.iter().map(|m| m.flags.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages in a folder; zero if it does not exist.
    #[must_use]
    pub fn message_count(&self, user: &str, folder: &str) -> usize {
        self.inner
            .lock()
            .folder_mut(user, folder)
            .map_or(0, |messages| messages.len())
    }

    /// Takes the server on or offline. Offline servers refuse logins and
    /// report every store disconnected.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    /// Disconnects every existing store. New logins still succeed.
    pub fn drop_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes store closes fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats
    }
}

/// [`Transport`] for a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryTransport {
    server: Arc<ServerInner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_store(&self, session: Arc<Session>) -> TransportResult<Box<dyn MailStore>> {
        Ok(Box::new(MemoryStore {
            server: Arc::clone(&self.server),
            session,
            login: None,
        }))
    }

    async fn send(&self, session: &Session, message: &OutgoingMessage) -> TransportResult<()> {
        if !self.server.online() {
            return Err(TransportError::Connection(format!(
                "{}:{} is unreachable",
                session.host(),
                session.port()
            )));
        }

        let mut state = self.server.lock();
        for recipient in &message.recipients {
            let stored = StoredMessage::new(Bytes::from(message.data.clone()), Utc::now());
            match state.folder_mut(recipient, DEFAULT_FOLDER) {
                Ok(inbox) => inbox.push(stored),
                Err(_) => debug!(%recipient, "no local mailbox, message dropped"),
            }
        }
        state.stats.messages_sent += 1;
        Ok(())
    }
}

/// Who a store is logged in as, and in which server generation.
#[derive(Debug, Clone)]
struct Login {
    user: String,
    generation: u64,
}

struct MemoryStore {
    server: Arc<ServerInner>,
    session: Arc<Session>,
    login: Option<Login>,
}

impl MemoryStore {
    fn live_login(&self) -> Option<&Login> {
        self.login
            .as_ref()
            .filter(|l| self.server.online() && l.generation == self.server.generation())
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn connect(&mut self) -> TransportResult<()> {
        if !self.server.online() {
            return Err(TransportError::Connection(format!(
                "{}:{} is unreachable",
                self.session.host(),
                self.session.port()
            )));
        }

        let auth = self.session.authentication();
        let mut state = self.server.lock();
        let valid = state
            .accounts
            .get(auth.username())
            .is_some_and(|a| a.password == auth.password());
        if !valid {
            return Err(TransportError::Authentication(format!(
                "invalid credentials for {}",
                auth.username()
            )));
        }

        state.stats.store_connects += 1;
        self.login = Some(Login {
            user: auth.username().to_string(),
            generation: self.server.generation(),
        });
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.live_login().is_some()
    }

    async fn open_folder(
        &mut self,
        name: &str,
        mode: FolderMode,
    ) -> TransportResult<Box<dyn MailFolder>> {
        let login = self.live_login().cloned().ok_or(TransportError::NotConnected)?;
        let name = if name.eq_ignore_ascii_case(DEFAULT_FOLDER) {
            DEFAULT_FOLDER
        } else {
            name
        };
        if matches!(self.session.protocol(), Protocol::Pop3 | Protocol::Pop3s)
            && name != DEFAULT_FOLDER
        {
            return Err(TransportError::FolderNotFound(name.to_string()));
        }

        let mut state = self.server.lock();
        state.folder_mut(&login.user, name)?;
        state.stats.folder_opens += 1;
        Ok(Box::new(MemoryFolder {
            server: Arc::clone(&self.server),
            login,
            name: name.to_string(),
            mode,
            open: true,
        }))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.login = None;
        if self.server.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Operation("logout rejected".into()));
        }
        Ok(())
    }
}

struct MemoryFolder {
    server: Arc<ServerInner>,
    login: Login,
    name: String,
    mode: FolderMode,
    open: bool,
}

impl MemoryFolder {
    fn check(&self) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::FolderClosed(self.name.clone()));
        }
        if !self.server.online() || self.login.generation != self.server.generation() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn with_messages<T>(
        &self,
        f: impl FnOnce(&mut Vec<StoredMessage>) -> TransportResult<T>,
    ) -> TransportResult<T> {
        self.check()?;
        let mut state = self.server.lock();
        f(state.folder_mut(&self.login.user, &self.name)?)
    }
}

fn index_of(message: MessageRef, len: usize) -> TransportResult<usize> {
    usize::try_from(message.0)
        .ok()
        .and_then(|n| n.checked_sub(1))
        .filter(|&i| i < len)
        .ok_or_else(|| TransportError::Operation(format!("no message {}", message.0)))
}

#[async_trait]
impl MailFolder for MemoryFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> FolderMode {
        self.mode
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn message_count(&self) -> TransportResult<usize> {
        self.with_messages(|messages| Ok(messages.len()))
    }

    async fn search(&self, term: &SearchTerm) -> TransportResult<Vec<MessageRef>> {
        self.with_messages(|messages| {
            Ok((1u32..)
                .zip(messages.iter())
                .filter(|(_, m)| term.matches(&m.meta()))
                .map(|(n, _)| MessageRef(n))
                .collect())
        })
    }

    async fn set_flags(
        &mut self,
        messages: &[MessageRef],
        flags: &Flags,
        set: bool,
    ) -> TransportResult<()> {
        if self.mode == FolderMode::ReadOnly {
            return Err(TransportError::ReadOnly(self.name.clone()));
        }
        self.with_messages(|stored| {
            let indices = messages
                .iter()
                .map(|&m| index_of(m, stored.len()))
                .collect::<TransportResult<Vec<_>>>()?;
            for i in indices {
                stored[i].flags.apply(flags, set);
            }
            Ok(())
        })
    }

    async fn fetch(&self, message: MessageRef) -> TransportResult<Bytes> {
        self.with_messages(|messages| {
            let i = index_of(message, messages.len())?;
            Ok(messages[i].raw.clone())
        })
    }

    async fn close(&mut self, expunge: bool) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::FolderClosed(self.name.clone()));
        }
        self.open = false;

        let mut state = self.server.lock();
        if expunge && self.mode == FolderMode::ReadWrite {
            let messages = state.folder_mut(&self.login.user, &self.name)?;
            let before = messages.len();
            messages.retain(|m| !m.flags.is_deleted());
            debug!(folder = %self.name, removed = before - messages.len(), "expunged");
        }
        state.stats.folder_closes += 1;
        state.stats.last_close_expunge = Some(expunge);
        Ok(())
    }
}
