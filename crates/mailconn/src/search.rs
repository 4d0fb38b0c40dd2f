//! Search predicates over folder contents.

use chrono::{DateTime, Utc};
use mailconn_mime::Message;
use regex::Regex;

use crate::config::MailboxQuery;
use crate::flags::{Flag, Flags};
use crate::{Error, Result};

/// A predicate a folder evaluates when searching.
#[derive(Debug, Clone)]
pub enum SearchTerm {
    /// Every term matches. Empty matches everything.
    And(Vec<SearchTerm>),
    /// The flag is present (`set`) or absent.
    Flag {
        /// Flag to test.
        flag: Flag,
        /// Expected presence.
        set: bool,
    },
    /// The decoded subject matches.
    Subject(Regex),
    /// The From address matches.
    From(Regex),
    /// The `Message-ID` header equals the value.
    MessageId(String),
    /// Received strictly after.
    ReceivedAfter(DateTime<Utc>),
    /// Received strictly before.
    ReceivedBefore(DateTime<Utc>),
    /// Sent strictly after.
    SentAfter(DateTime<Utc>),
    /// Sent strictly before.
    SentBefore(DateTime<Utc>),
}

/// The parts of a stored message a [`SearchTerm`] inspects.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta<'a> {
    /// Current flags.
    pub flags: Option<&'a Flags>,
    /// Decoded subject.
    pub subject: Option<&'a str>,
    /// From header as received.
    pub from: Option<&'a str>,
    /// Message-ID header.
    pub message_id: Option<&'a str>,
    /// Delivery time.
    pub received: Option<DateTime<Utc>>,
    /// Date header.
    pub sent: Option<DateTime<Utc>>,
}

/// Header fields of a stored message, decoded once and kept for searching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HeaderSummary {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub message_id: Option<String>,
    pub sent: Option<DateTime<Utc>>,
}

impl HeaderSummary {
    /// Reads the summary from a full message or its header block alone.
    /// Unparseable input yields an empty summary.
    pub fn parse(raw: &[u8]) -> Self {
        let Ok(message) = Message::parse(raw) else {
            return Self::default();
        };
        let header = |name: &str| message.headers().get(name).map(|v| v.trim().to_string());
        Self {
            subject: message.subject(),
            from: header("from"),
            message_id: header("message-id"),
            sent: message.date().map(|d| d.with_timezone(&Utc)),
        }
    }

    pub fn meta<'a>(&'a self, flags: &'a Flags, received: Option<DateTime<Utc>>) -> MessageMeta<'a> {
        MessageMeta {
            flags: Some(flags),
            subject: self.subject.as_deref(),
            from: self.from.as_deref(),
            message_id: self.message_id.as_deref(),
            received,
            sent: self.sent,
        }
    }
}

impl SearchTerm {
    /// Matches every message.
    #[must_use]
    pub const fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Matches a `Message-ID`, with or without angle brackets.
    #[must_use]
    pub fn message_id(id: impl Into<String>) -> Self {
        Self::MessageId(id.into())
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn matches(&self, meta: &MessageMeta<'_>) -> bool {
        match self {
            Self::And(terms) => terms.iter().all(|t| t.matches(meta)),
            Self::Flag { flag, set } => {
                meta.flags.is_some_and(|f| f.contains(flag)) == *set
            }
            Self::Subject(re) => meta.subject.is_some_and(|s| re.is_match(s)),
            Self::From(re) => meta.from.is_some_and(|s| re.is_match(s)),
            Self::MessageId(id) => meta
                .message_id
                .is_some_and(|m| strip_angles(m) == strip_angles(id)),
            Self::ReceivedAfter(t) => meta.received.is_some_and(|r| r > *t),
            Self::ReceivedBefore(t) => meta.received.is_some_and(|r| r < *t),
            Self::SentAfter(t) => meta.sent.is_some_and(|s| s > *t),
            Self::SentBefore(t) => meta.sent.is_some_and(|s| s < *t),
        }
    }
}

fn strip_angles(id: &str) -> &str {
    let id = id.trim();
    id.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(id)
}

impl MailboxQuery {
    /// Builds the conjunction of every configured filter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a regular expression is invalid.
    pub fn search_term(&self) -> Result<SearchTerm> {
        let mut terms = Vec::new();

        let flags = [
            (Flag::Seen, self.seen),
            (Flag::Answered, self.answered),
            (Flag::Recent, self.recent),
            (Flag::Deleted, self.deleted),
        ];
        for (flag, wanted) in flags {
            if let Some(set) = wanted {
                terms.push(SearchTerm::Flag { flag, set });
            }
        }

        if let Some(pattern) = self.subject_regex.as_deref() {
            terms.push(SearchTerm::Subject(compile("subjectRegex", pattern)?));
        }
        if let Some(pattern) = self.from_regex.as_deref() {
            terms.push(SearchTerm::From(compile("fromRegex", pattern)?));
        }

        let dates: [(Option<DateTime<Utc>>, fn(DateTime<Utc>) -> SearchTerm); 4] = [
            (self.received_since, SearchTerm::ReceivedAfter),
            (self.received_until, SearchTerm::ReceivedBefore),
            (self.sent_since, SearchTerm::SentAfter),
            (self.sent_until, SearchTerm::SentBefore),
        ];
        terms.extend(dates.into_iter().filter_map(|(date, term)| date.map(term)));

        Ok(SearchTerm::And(terms))
    }
}

fn compile(field: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Configuration(format!("Invalid {field} '{pattern}': {e}")))
}
