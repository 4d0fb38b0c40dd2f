//! POP3 stores.
//!
//! A POP3 maildrop has a single folder, `INBOX`. Messages are addressed by
//! their number in the maildrop. `\Deleted` is sent to the server as `DELE`
//! and committed by `QUIT` when the folder is closed with expunge; other
//! flags only live for the open folder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::net::{deadline, open_stream, read_line, read_timeout, upgrade};
use super::{FolderMode, MailFolder, MailStore, MessageRef, TransportError, TransportResult};
use crate::config::DEFAULT_FOLDER;
use crate::flags::{Flag, Flags};
use crate::search::{HeaderSummary, SearchTerm};
use crate::session::Session;
use crate::tls::MailStream;

/// A POP3 conversation in the TRANSACTION state.
struct Pop3Client {
    stream: BufReader<MailStream>,
    limit: Option<Duration>,
}

impl Pop3Client {
    async fn connect(session: &Session) -> TransportResult<Self> {
        let limit = read_timeout(session);
        let mut client = Self {
            stream: BufReader::new(open_stream(session).await?),
            limit,
        };
        deadline(limit, client.status()).await?;

        if session.uses_starttls() {
            client.command("STLS").await?;
            let stream = upgrade(client.stream.into_inner(), session).await?;
            client = Self {
                stream: BufReader::new(stream),
                limit,
            };
        }

        let auth = session.authentication();
        let login = async {
            client.command(&format!("USER {}", auth.username())).await?;
            client.command(&format!("PASS {}", auth.password())).await
        };
        login.await.map_err(|e| match e {
            TransportError::Operation(reason) => TransportError::Authentication(reason),
            other => other,
        })?;
        debug!(host = %session.host(), user = %auth.username(), "POP3 login");
        Ok(client)
    }

    /// Reads a status line, returning the text after `+OK`.
    async fn status(&mut self) -> TransportResult<String> {
        let line = read_line(&mut self.stream).await?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim_start().to_string())
        } else {
            let reason = line.strip_prefix("-ERR").unwrap_or(&line).trim();
            Err(TransportError::Operation(reason.to_string()))
        }
    }

    async fn send(&mut self, command: &str) -> TransportResult<()> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn command(&mut self, command: &str) -> TransportResult<String> {
        let limit = self.limit;
        deadline(limit, async {
            self.send(command).await?;
            self.status().await
        })
        .await
    }

    /// Runs a command answered by a dot-terminated block.
    async fn multiline(&mut self, command: &str) -> TransportResult<Vec<u8>> {
        let limit = self.limit;
        deadline(limit, async {
            self.send(command).await?;
            self.status().await?;
            let mut body = Vec::new();
            let mut line = Vec::new();
            loop {
                line.clear();
                if self.stream.read_until(b'\n', &mut line).await? == 0 {
                    return Err(TransportError::Connection(
                        "server closed the connection".into(),
                    ));
                }
                let content = line.strip_suffix(b"\n").unwrap_or(&line);
                let content = content.strip_suffix(b"\r").unwrap_or(content);
                if content == b"." {
                    return Ok(body);
                }
                let unstuffed = content.strip_prefix(b".").unwrap_or(content);
                body.extend_from_slice(unstuffed);
                body.extend_from_slice(b"\r\n");
            }
        })
        .await
    }

    async fn stat(&mut self) -> TransportResult<usize> {
        let reply = self.command("STAT").await?;
        reply
            .split_whitespace()
            .next()
            .and_then(|count| count.parse().ok())
            .ok_or_else(|| TransportError::Operation(format!("malformed STAT reply: {reply}")))
    }
}

type Shared = Arc<Mutex<Option<Pop3Client>>>;

pub(super) struct Pop3Store {
    session: Arc<Session>,
    client: Shared,
}

impl Pop3Store {
    pub(super) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            client: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl MailStore for Pop3Store {
    async fn connect(&mut self) -> TransportResult<()> {
        let client = Pop3Client::connect(&self.session).await?;
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.client.lock().await.as_mut() {
            Some(client) => client.command("NOOP").await.is_ok(),
            None => false,
        }
    }

    async fn open_folder(
        &mut self,
        name: &str,
        mode: FolderMode,
    ) -> TransportResult<Box<dyn MailFolder>> {
        if !name.eq_ignore_ascii_case(DEFAULT_FOLDER) {
            return Err(TransportError::FolderNotFound(name.to_string()));
        }
        let count = {
            let mut guard = self.client.lock().await;
            let client = guard.as_mut().ok_or(TransportError::NotConnected)?;
            client.stat().await?
        };
        debug!(count, ?mode, "maildrop opened");
        Ok(Box::new(Pop3Folder {
            client: Arc::clone(&self.client),
            mode,
            open: true,
            flags: vec![Flags::new(); count],
        }))
    }

    async fn close(&mut self) -> TransportResult<()> {
        let Some(mut client) = self.client.lock().await.take() else {
            return Ok(());
        };
        client.command("QUIT").await.map(drop)
    }
}

struct Pop3Folder {
    client: Shared,
    mode: FolderMode,
    open: bool,
    /// Local flags, indexed by message number minus one.
    flags: Vec<Flags>,
}

impl Pop3Folder {
    fn check(&self) -> TransportResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::FolderClosed(DEFAULT_FOLDER.to_string()))
        }
    }

    fn index(&self, message: MessageRef) -> TransportResult<usize> {
        usize::try_from(message.0)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .filter(|&i| i < self.flags.len())
            .ok_or_else(|| TransportError::Operation(format!("no message {}", message.0)))
    }
}

#[async_trait]
impl MailFolder for Pop3Folder {
    fn name(&self) -> &str {
        DEFAULT_FOLDER
    }

    fn mode(&self) -> FolderMode {
        self.mode
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn message_count(&self) -> TransportResult<usize> {
        self.check()?;
        Ok(self.flags.len())
    }

    async fn search(&self, term: &SearchTerm) -> TransportResult<Vec<MessageRef>> {
        self.check()?;
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut matched = Vec::new();
        for (number, flags) in (1u32..).zip(&self.flags) {
            let headers = if flags.is_deleted() {
                HeaderSummary::default()
            } else {
                HeaderSummary::parse(&client.multiline(&format!("TOP {number} 0")).await?)
            };
            if term.matches(&headers.meta(flags, None)) {
                matched.push(MessageRef(number));
            }
        }
        Ok(matched)
    }

    async fn set_flags(
        &mut self,
        messages: &[MessageRef],
        flags: &Flags,
        set: bool,
    ) -> TransportResult<()> {
        self.check()?;
        if self.mode == FolderMode::ReadOnly {
            return Err(TransportError::ReadOnly(DEFAULT_FOLDER.to_string()));
        }
        let deleting = flags.is_deleted();
        if deleting && !set {
            return Err(TransportError::Unsupported(
                "POP3 cannot undelete a single message".into(),
            ));
        }
        let indices = messages
            .iter()
            .map(|&m| self.index(m))
            .collect::<TransportResult<Vec<_>>>()?;

        if deleting {
            let mut guard = self.client.lock().await;
            let client = guard.as_mut().ok_or(TransportError::NotConnected)?;
            for &i in &indices {
                if !self.flags[i].is_deleted() {
                    client.command(&format!("DELE {}", i + 1)).await?;
                }
            }
        }
        for i in indices {
            self.flags[i].apply(flags, set);
        }
        Ok(())
    }

    async fn fetch(&self, message: MessageRef) -> TransportResult<Bytes> {
        let i = self.index(message)?;
        if self.flags[i].is_deleted() {
            return Err(TransportError::Operation(format!(
                "message {} is deleted",
                message.0
            )));
        }
        self.check()?;
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let raw = client.multiline(&format!("RETR {}", message.0)).await?;
        Ok(Bytes::from(raw))
    }

    async fn close(&mut self, expunge: bool) -> TransportResult<()> {
        self.check()?;
        self.open = false;
        let mut guard = self.client.lock().await;
        let pending = self.flags.iter().any(Flags::is_deleted);

        if expunge && self.mode == FolderMode::ReadWrite {
            // Deletions are only committed by ending the session.
            if let Some(mut client) = guard.take() {
                client.command("QUIT").await?;
                debug!(expunged = pending, "maildrop closed");
            }
        } else if pending && let Some(client) = guard.as_mut() {
            if let Err(e) = client.command("RSET").await {
                warn!(error = %e, "could not reset deletions");
                return Err(e);
            }
        }
        self.flags.iter_mut().for_each(|f| f.remove(&Flag::Deleted));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::Protocol;
    use crate::session::create_session;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one scripted conversation and returns everything the client
    /// sent.
    async fn scripted(replies: &'static [&'static str]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for reply in replies {
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
            socket.shutdown().await.unwrap();
            let mut sent = String::new();
            socket.read_to_string(&mut sent).await.unwrap();
            sent
        });
        (port, handle)
    }

    fn session(port: u16) -> Session {
        let config = ConnectionConfig::builder("pop", "127.0.0.1", port, Protocol::Pop3)
            .credentials("support", "s3cret")
            .build();
        create_session(&config).unwrap()
    }

    #[tokio::test]
    async fn test_login_and_dot_unstuffing() {
        let (port, server) = scripted(&[
            "+OK POP3 ready\r\n",
            "+OK\r\n",
            "+OK logged in\r\n",
            "+OK message follows\r\n",
            "Subject: dots\r\n\r\n..leading\r\n.\r\n",
        ])
        .await;
        let mut client = Pop3Client::connect(&session(port)).await.unwrap();
        let body = client.multiline("RETR 1").await.unwrap();
        assert_eq!(body, b"Subject: dots\r\n\r\n.leading\r\n");
        drop(client);

        let sent = server.await.unwrap();
        assert_eq!(sent, "USER support\r\nPASS s3cret\r\nRETR 1\r\n");
    }

    #[tokio::test]
    async fn test_rejected_password() {
        let (port, _server) = scripted(&[
            "+OK POP3 ready\r\n",
            "+OK\r\n",
            "-ERR [AUTH] invalid password\r\n",
        ])
        .await;
        let err = Pop3Client::connect(&session(port)).await.err().unwrap();
        assert!(
            matches!(&err, TransportError::Authentication(reason) if reason.contains("invalid password")),
            "{err}"
        );
    }
}
