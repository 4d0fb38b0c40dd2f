//! Mailbox operations built on [`MailboxConnection`].
//!
//! Every operation opens the folder it needs and closes it again before
//! returning, whether or not the operation succeeded.

use mailconn_mime::OutgoingMessage;
use tracing::{debug, warn};

use crate::config::{DEFAULT_FOLDER, MailboxQuery};
use crate::connection::Connection;
use crate::flags::{Flag, Flags};
use crate::mailbox::{MailboxConnection, OpenFolder};
use crate::message::EmailMessage;
use crate::parser::MessageParser;
use crate::search::SearchTerm;
use crate::transport::FolderMode;
use crate::{Error, Result};

fn folder_or_inbox(folder: &str) -> &str {
    if folder.trim().is_empty() {
        DEFAULT_FOLDER
    } else {
        folder
    }
}

/// Combines an operation's outcome with the result of closing its folder.
/// The operation's error wins; a close error after a failure is only logged.
fn finish<T>(outcome: Result<T>, closed: Result<()>) -> Result<T> {
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!(error = %close, "failed to close folder after error");
            Err(e)
        }
    }
}

/// Sets `flags` on the message with the given `Message-ID`.
///
/// Opens `folder` read-write (`INBOX` when empty) and always closes it
/// afterwards, expunging if `expunge` is set. Returns false when `flags` is
/// empty.
///
/// # Errors
///
/// - [`Error::NotFound`] if no message has that `Message-ID`
/// - [`Error::ConnectionFailure`] if the folder cannot be opened
pub async fn change_state(
    conn: &MailboxConnection,
    folder: &str,
    message_id: &str,
    flags: &Flags,
    expunge: bool,
) -> Result<bool> {
    let mut open = conn
        .get_folder(folder_or_inbox(folder), FolderMode::ReadWrite)
        .await?;
    let outcome = flag_message(&mut open, message_id, flags).await;
    let closed = open.close(expunge).await;
    finish(outcome, closed)
}

async fn flag_message(open: &mut OpenFolder<'_>, message_id: &str, flags: &Flags) -> Result<bool> {
    let matches = open.search(&SearchTerm::message_id(message_id)).await?;
    let Some(&first) = matches.first() else {
        return Err(Error::NotFound(message_id.to_string()));
    };
    if flags.is_empty() {
        return Ok(false);
    }
    open.set_flags(&[first], flags, true).await?;
    debug!(folder = %open.name(), %message_id, %flags, "flags set");
    Ok(true)
}

/// Marks a message `\Deleted` without expunging.
///
/// # Errors
///
/// See [`change_state`].
pub async fn mark_as_deleted(conn: &MailboxConnection, folder: &str, message_id: &str) -> Result<bool> {
    change_state(conn, folder, message_id, &Flags::single(Flag::Deleted), false).await
}

/// Marks a message `\Deleted` and expunges the folder.
///
/// # Errors
///
/// See [`change_state`].
pub async fn delete_message(conn: &MailboxConnection, folder: &str, message_id: &str) -> Result<bool> {
    change_state(conn, folder, message_id, &Flags::single(Flag::Deleted), true).await
}

/// Removes every `\Deleted` message from a folder.
///
/// # Errors
///
/// Returns an error if the folder cannot be opened or closed.
pub async fn expunge_folder(conn: &MailboxConnection, folder: &str) -> Result<()> {
    let open = conn
        .get_folder(folder_or_inbox(folder), FolderMode::ReadWrite)
        .await?;
    open.close(true).await
}

/// Lists one page of messages matching `query`.
///
/// The folder is opened read-only unless `delete_after_retrieve` is set, in
/// which case the returned messages are marked `\Deleted` and expunged.
/// An offset past the last match yields an empty page.
///
/// # Errors
///
/// - [`Error::Configuration`] if a filter regex is invalid
/// - [`Error::ConnectionFailure`] if the folder cannot be opened
/// - [`Error::Parsing`] if a message cannot be parsed
pub async fn list_messages(
    conn: &MailboxConnection,
    query: &MailboxQuery,
    parser: &dyn MessageParser,
) -> Result<Vec<EmailMessage>> {
    let term = query.search_term()?;
    let mode = if query.delete_after_retrieve {
        FolderMode::ReadWrite
    } else {
        FolderMode::ReadOnly
    };

    let mut open = conn.get_folder(folder_or_inbox(&query.folder), mode).await?;
    let outcome = read_page(&mut open, &term, query, parser).await;
    let expunge = query.delete_after_retrieve && outcome.is_ok();
    let closed = open.close(expunge).await;
    finish(outcome, closed)
}

async fn read_page(
    open: &mut OpenFolder<'_>,
    term: &SearchTerm,
    query: &MailboxQuery,
    parser: &dyn MessageParser,
) -> Result<Vec<EmailMessage>> {
    let matches = open.search(term).await?;
    let start = query.offset.min(matches.len());
    let end = start.saturating_add(query.limit).min(matches.len());
    let page = &matches[start..end];
    debug!(
        folder = %open.name(),
        matched = matches.len(),
        offset = query.offset,
        returned = page.len(),
        "listing messages"
    );

    let mut messages = Vec::with_capacity(page.len());
    for &message in page {
        let raw = open.fetch(message).await?;
        let parsed = parser.parse(&raw).map_err(|source| Error::Parsing {
            context: format!("message {} in '{}'", message.0, open.name()),
            source,
        })?;
        messages.push(parsed);
    }

    if query.delete_after_retrieve && !page.is_empty() {
        open.set_flags(page, &Flags::single(Flag::Deleted), true).await?;
    }
    Ok(messages)
}

/// Sends a message through a send-only connection.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the connection cannot send or the
/// message has no recipients.
pub async fn send_message(connection: &Connection, message: &OutgoingMessage) -> Result<()> {
    connection.send(message).await
}
