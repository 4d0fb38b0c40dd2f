//! Conversion of raw messages into [`EmailMessage`]s.

use bytes::Bytes;
use mailconn_mime::{Message, format_address_list};

use crate::message::{Attachment, EmailMessage};

/// Boxed error returned by parsers.
pub type ParseError = Box<dyn std::error::Error + Send + Sync>;

/// Turns raw RFC 5322 bytes into a read model.
pub trait MessageParser: Send + Sync {
    /// Parses one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be parsed.
    fn parse(&self, raw: &Bytes) -> Result<EmailMessage, ParseError>;
}

/// The default parser, built on `mailconn-mime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeParser;

impl MessageParser for MimeParser {
    fn parse(&self, raw: &Bytes) -> Result<EmailMessage, ParseError> {
        let message = Message::parse(raw)?;
        let list = |name: &str| format_address_list(&message.addresses(name));

        let mut attachments = Vec::new();
        for (index, entity) in message.attachments().into_iter().enumerate() {
            let name = entity
                .filename()
                .unwrap_or_else(|| format!("attachment-{}", index + 1));
            attachments.push(Attachment {
                name,
                content_type: entity.content_type().mime_type(),
                content: Bytes::from(entity.decoded_body()?),
            });
        }

        Ok(EmailMessage {
            id: message.message_id().unwrap_or_default().trim().to_string(),
            from: list("from"),
            to: list("to"),
            cc: list("cc"),
            bcc: list("bcc"),
            reply_to: list("reply-to"),
            subject: message.subject().unwrap_or_default(),
            text_content: message.text_body("plain")?,
            html_content: message.text_body("html")?,
            attachments,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use mailconn_mime::MessageBuilder;

    #[test]
    fn test_parse_built_message() {
        let built = MessageBuilder::new()
            .from("Alice <alice@example.com>")
            .to("bob@example.com, carol@example.com")
            .reply_to("desk@example.com")
            .subject("Quarterly report")
            .body("Numbers attached.", "text/plain")
            .attach("q3.csv", "text/csv", "a,b\n1,2\n")
            .build()
            .unwrap();

        let message = MimeParser.parse(&Bytes::from(built.data)).unwrap();
        assert!(message.id.starts_with('<'));
        assert_eq!(message.from, "Alice <alice@example.com>");
        assert_eq!(message.to, "bob@example.com, carol@example.com");
        assert_eq!(message.reply_to, "desk@example.com");
        assert_eq!(message.subject, "Quarterly report");
        assert_eq!(message.text_content.as_deref(), Some("Numbers attached."));
        assert!(message.html_content.is_none());
        assert_eq!(message.attachments.len(), 1);

        let csv = message.attachment(0).unwrap();
        assert_eq!(csv.name, "q3.csv");
        assert_eq!(csv.content_type, "text/csv");
        assert_eq!(&csv.content[..], b"a,b\n1,2\n");
    }

    #[test]
    fn test_parse_rejects_malformed_headers() {
        let raw = Bytes::from_static(b"Not a header line\r\n\r\nbody");
        assert!(MimeParser.parse(&raw).is_err());
    }
}
