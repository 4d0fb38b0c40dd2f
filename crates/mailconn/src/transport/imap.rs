//! IMAP stores on async-imap.
//!
//! Messages are addressed by UID. Flag-only searches run on the server;
//! anything else fetches flags, internal dates and headers for the
//! server-side candidates and filters them with [`SearchTerm::matches`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag as ImapFlag};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::net::{deadline, open_stream, read_line, read_timeout, upgrade};
use super::{FolderMode, MailFolder, MailStore, MessageRef, TransportError, TransportResult};
use crate::flags::{Flag, Flags};
use crate::search::{HeaderSummary, SearchTerm};
use crate::session::Session;
use crate::tls::MailStream;

type ImapSession = async_imap::Session<MailStream>;

/// Logged-in session shared by a store and its open folder.
type Shared = Arc<Mutex<Option<ImapSession>>>;

const SUMMARY_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER])";

fn imap_error(e: ImapError) -> TransportError {
    match e {
        ImapError::Io(e) => TransportError::Io(e),
        ImapError::ConnectionLost => TransportError::NotConnected,
        other => TransportError::Operation(other.to_string()),
    }
}

/// Runs an async-imap call under the read timeout.
async fn run<T>(
    limit: Option<Duration>,
    op: impl Future<Output = async_imap::error::Result<T>>,
) -> TransportResult<T> {
    deadline(limit, async { op.await.map_err(imap_error) }).await
}

/// Reads the greeting and asks for STARTTLS before any other command.
async fn starttls(stream: MailStream, session: &Session) -> TransportResult<MailStream> {
    let mut reader = BufReader::new(stream);
    let greeting = read_line(&mut reader).await?;
    if !greeting.starts_with("* OK") {
        return Err(TransportError::Connection(format!(
            "unexpected greeting: {greeting}"
        )));
    }
    reader.get_mut().write_all(b"T0 STARTTLS\r\n").await?;
    loop {
        let line = read_line(&mut reader).await?;
        if let Some(status) = line.strip_prefix("T0 ") {
            if status.starts_with("OK") {
                break;
            }
            return Err(TransportError::Connection(format!(
                "STARTTLS refused: {status}"
            )));
        }
    }
    upgrade(reader.into_inner(), session).await
}

pub(super) struct ImapStore {
    session: Arc<Session>,
    imap: Shared,
    limit: Option<Duration>,
}

impl ImapStore {
    pub(super) fn new(session: Arc<Session>) -> Self {
        let limit = read_timeout(&session);
        Self {
            session,
            imap: Arc::new(Mutex::new(None)),
            limit,
        }
    }
}

#[async_trait]
impl MailStore for ImapStore {
    async fn connect(&mut self) -> TransportResult<()> {
        let session = &self.session;
        let mut stream = open_stream(session).await?;
        if session.uses_starttls() {
            stream = deadline(self.limit, starttls(stream, session)).await?;
        }

        let auth = session.authentication();
        let client = async_imap::Client::new(stream);
        let login = deadline(self.limit, async {
            client
                .login(auth.username(), auth.password())
                .await
                .map_err(|(e, _)| TransportError::Authentication(e.to_string()))
        })
        .await?;
        debug!(host = %session.host(), user = %auth.username(), "IMAP login");
        *self.imap.lock().await = Some(login);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut guard = self.imap.lock().await;
        match guard.as_mut() {
            Some(imap) => run(self.limit, imap.noop()).await.is_ok(),
            None => false,
        }
    }

    async fn open_folder(
        &mut self,
        name: &str,
        mode: FolderMode,
    ) -> TransportResult<Box<dyn MailFolder>> {
        let mut guard = self.imap.lock().await;
        let imap = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mailbox = deadline(self.limit, async {
            let opened = match mode {
                FolderMode::ReadOnly => imap.examine(name).await,
                FolderMode::ReadWrite => imap.select(name).await,
            };
            opened.map_err(|e| match e {
                ImapError::No(reason) => {
                    debug!(folder = name, %reason, "folder refused");
                    TransportError::FolderNotFound(name.to_string())
                }
                other => imap_error(other),
            })
        })
        .await?;
        debug!(folder = name, ?mode, exists = mailbox.exists, "folder opened");

        Ok(Box::new(ImapFolder {
            imap: Arc::clone(&self.imap),
            name: name.to_string(),
            mode,
            open: true,
            limit: self.limit,
        }))
    }

    async fn close(&mut self) -> TransportResult<()> {
        let Some(mut imap) = self.imap.lock().await.take() else {
            return Ok(());
        };
        run(self.limit, imap.logout()).await
    }
}

struct ImapFolder {
    imap: Shared,
    name: String,
    mode: FolderMode,
    open: bool,
    limit: Option<Duration>,
}

impl ImapFolder {
    fn check(&self) -> TransportResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::FolderClosed(self.name.clone()))
        }
    }

    async fn uid_search(&self, criteria: &str) -> TransportResult<Vec<u32>> {
        self.check()?;
        let mut guard = self.imap.lock().await;
        let imap = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut uids: Vec<u32> = run(self.limit, imap.uid_search(criteria))
            .await?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn uid_fetch(&self, uids: &[u32], items: &str) -> TransportResult<Vec<Fetch>> {
        self.check()?;
        let mut guard = self.imap.lock().await;
        let imap = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let set = uid_set(uids);
        run(self.limit, async {
            imap.uid_fetch(&set, items)
                .await?
                .try_collect::<Vec<Fetch>>()
                .await
        })
        .await
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Translates the flag terms of `term` into IMAP search keys. Returns the
/// criteria and whether they decide the whole term.
fn server_criteria(term: &SearchTerm) -> (String, bool) {
    let mut keys = Vec::new();
    let exact = collect_keys(term, &mut keys);
    if keys.is_empty() {
        keys.push("ALL".to_string());
    }
    (keys.join(" "), exact)
}

fn collect_keys(term: &SearchTerm, keys: &mut Vec<String>) -> bool {
    match term {
        SearchTerm::And(terms) => terms
            .iter()
            .fold(true, |exact, t| collect_keys(t, keys) && exact),
        SearchTerm::Flag { flag, set } => {
            let key = match (flag, set) {
                (Flag::Seen, true) => "SEEN".to_string(),
                (Flag::Seen, false) => "UNSEEN".to_string(),
                (Flag::Answered, true) => "ANSWERED".to_string(),
                (Flag::Answered, false) => "UNANSWERED".to_string(),
                (Flag::Deleted, true) => "DELETED".to_string(),
                (Flag::Deleted, false) => "UNDELETED".to_string(),
                (Flag::Recent, true) => "RECENT".to_string(),
                (Flag::Recent, false) => "OLD".to_string(),
                (Flag::Keyword(k), true) => format!("KEYWORD {k}"),
                (Flag::Keyword(k), false) => format!("UNKEYWORD {k}"),
            };
            keys.push(key);
            true
        }
        _ => false,
    }
}

fn to_flag(flag: ImapFlag<'_>) -> Flag {
    match flag {
        ImapFlag::Seen => Flag::Seen,
        ImapFlag::Answered => Flag::Answered,
        ImapFlag::Deleted => Flag::Deleted,
        ImapFlag::Recent => Flag::Recent,
        ImapFlag::Flagged => Flag::Keyword("\\Flagged".into()),
        ImapFlag::Draft => Flag::Keyword("\\Draft".into()),
        ImapFlag::MayCreate => Flag::Keyword("\\*".into()),
        ImapFlag::Custom(name) => Flag::from_wire(&name),
    }
}

#[async_trait]
impl MailFolder for ImapFolder {
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
        Ok(self.uid_search("ALL").await?.len())
    }

    async fn search(&self, term: &SearchTerm) -> TransportResult<Vec<MessageRef>> {
        let (criteria, exact) = server_criteria(term);
        let candidates = self.uid_search(&criteria).await?;
        if exact || candidates.is_empty() {
            return Ok(candidates.into_iter().map(MessageRef).collect());
        }

        let mut matched: Vec<u32> = self
            .uid_fetch(&candidates, SUMMARY_ITEMS)
            .await?
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let flags: Flags = fetch.flags().map(to_flag).collect();
                let headers = fetch.header().map(HeaderSummary::parse).unwrap_or_default();
                let received = fetch.internal_date().map(|d| d.with_timezone(&Utc));
                term.matches(&headers.meta(&flags, received)).then_some(uid)
            })
            .collect();
        matched.sort_unstable();
        debug!(
            folder = %self.name,
            %criteria,
            candidates = candidates.len(),
            matched = matched.len(),
            "searched"
        );
        Ok(matched.into_iter().map(MessageRef).collect())
    }

    async fn set_flags(
        &mut self,
        messages: &[MessageRef],
        flags: &Flags,
        set: bool,
    ) -> TransportResult<()> {
        self.check()?;
        if self.mode == FolderMode::ReadOnly {
            return Err(TransportError::ReadOnly(self.name.clone()));
        }
        if messages.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let uids: Vec<u32> = messages.iter().map(|m| m.0).collect();
        let query = format!("{}FLAGS.SILENT {flags}", if set { '+' } else { '-' });

        let mut guard = self.imap.lock().await;
        let imap = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let uid_list = uid_set(&uids);
        run(self.limit, async {
            imap.uid_store(&uid_list, &query)
                .await?
                .try_collect::<Vec<Fetch>>()
                .await
        })
        .await?;
        Ok(())
    }

    async fn fetch(&self, message: MessageRef) -> TransportResult<Bytes> {
        self.uid_fetch(&[message.0], "BODY.PEEK[]")
            .await?
            .iter()
            .find_map(|fetch| fetch.body().map(Bytes::copy_from_slice))
            .ok_or_else(|| TransportError::Operation(format!("no message with UID {}", message.0)))
    }

    async fn close(&mut self, expunge: bool) -> TransportResult<()> {
        self.check()?;
        self.open = false;
        let mut guard = self.imap.lock().await;
        let imap = guard.as_mut().ok_or(TransportError::NotConnected)?;

        // CLOSE expunges a selected folder; re-examining first makes it a
        // plain deselect.
        if self.mode == FolderMode::ReadWrite && !expunge {
            if let Err(e) = run(self.limit, imap.examine(&self.name)).await {
                warn!(folder = %self.name, error = %e, "could not re-examine before close");
            }
        }
        run(self.limit, imap.close()).await?;
        debug!(folder = %self.name, expunge, "folder closed");
        Ok(())
    }
}
