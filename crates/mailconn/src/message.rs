//! Read models for retrieved messages.

use std::io::Cursor;

use bytes::Bytes;
use serde::Serialize;

/// A retrieved message flattened for callers.
///
/// Address fields hold comma-separated lists as rendered in headers; empty
/// when the header is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    /// `Message-ID` header.
    pub id: String,
    /// Sender.
    pub from: String,
    /// Primary recipients.
    pub to: String,
    /// Carbon-copy recipients.
    pub cc: String,
    /// Blind carbon-copy recipients, when the stored copy still carries them.
    pub bcc: String,
    /// Reply-To addresses.
    pub reply_to: String,
    /// Decoded subject.
    pub subject: String,
    /// First `text/plain` body.
    pub text_content: Option<String>,
    /// First `text/html` body.
    pub html_content: Option<String>,
    /// Attachments in message order.
    pub attachments: Vec<Attachment>,
}

impl EmailMessage {
    /// Returns the attachment at `index`.
    #[must_use]
    pub fn attachment(&self, index: usize) -> Option<&Attachment> {
        self.attachments.get(index)
    }
}

/// A decoded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// File name.
    pub name: String,
    /// MIME type, e.g. `application/pdf`.
    pub content_type: String,
    /// Decoded content.
    #[serde(skip)]
    pub content: Bytes,
}

impl Attachment {
    /// Size of the decoded content in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Returns a reader over the content.
    #[must_use]
    pub fn reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.content.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_attachment_by_index() {
        let message = EmailMessage {
            attachments: vec![Attachment {
                name: "a.txt".into(),
                content_type: "text/plain".into(),
                content: Bytes::from_static(b"hello"),
            }],
            ..EmailMessage::default()
        };
        let first = message.attachment(0).unwrap();
        assert_eq!(first.size(), 5);

        let mut text = String::new();
        first.reader().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
        assert!(message.attachment(1).is_none());
    }

    #[test]
    fn test_serializes_camel_case_without_content() {
        let message = EmailMessage {
            id: "<1@h>".into(),
            reply_to: "r@h".into(),
            attachments: vec![Attachment {
                name: "a.bin".into(),
                content_type: "application/octet-stream".into(),
                content: Bytes::from_static(b"\0\x01"),
            }],
            ..EmailMessage::default()
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["replyTo"], "r@h");
        assert_eq!(json["attachments"][0]["contentType"], "application/octet-stream");
        assert!(json["attachments"][0].get("content").is_none());
    }
}
