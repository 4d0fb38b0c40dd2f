//! Outgoing message construction.

use crate::address::{Address, format_address_list, parse_address_list};
use crate::content_type::ContentType;
use crate::encoding::{
    encode_base64_lines, encode_charset, encode_quoted_printable_bytes, encode_rfc2047,
};
use crate::error::{Error, Result};
use crate::header::Headers;
use crate::message::TransferEncoding;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Longest line allowed in an unencoded body (RFC 5322).
const MAX_RAW_LINE: usize = 998;

/// A rendered message ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Envelope sender, if one was set.
    pub sender: Option<String>,
    /// Envelope recipients: To, Cc and Bcc, deduplicated.
    pub recipients: Vec<String>,
    /// RFC 5322 message bytes.
    pub data: Vec<u8>,
}

impl OutgoingMessage {
    /// Creates a message from pre-rendered bytes.
    #[must_use]
    pub const fn new(sender: Option<String>, recipients: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            sender,
            recipients,
            data,
        }
    }
}

#[derive(Debug, Clone)]
struct AttachmentPart {
    name: String,
    content_type: String,
    content: Vec<u8>,
}

/// Builder for outgoing messages.
///
/// Address setters accept comma-separated lists; they are parsed and
/// validated by [`MessageBuilder::build`]. The body defaults to
/// `text/html` in UTF-8.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    reply_to: Vec<String>,
    subject: Option<String>,
    headers: Headers,
    body: String,
    content_type: String,
    charset: String,
    transfer_encoding: Option<TransferEncoding>,
    attachments: Vec<AttachmentPart>,
    date: Option<DateTime<Utc>>,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self {
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            subject: None,
            headers: Headers::new(),
            body: String::new(),
            content_type: "text/html".to_string(),
            charset: "UTF-8".to_string(),
            transfer_encoding: None,
            attachments: Vec::new(),
            date: None,
        }
    }
}

impl MessageBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the From address.
    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    /// Adds To recipients.
    #[must_use]
    pub fn to(mut self, addresses: impl Into<String>) -> Self {
        self.to.push(addresses.into());
        self
    }

    /// Adds Cc recipients.
    #[must_use]
    pub fn cc(mut self, addresses: impl Into<String>) -> Self {
        self.cc.push(addresses.into());
        self
    }

    /// Adds Bcc recipients. They receive the message but never appear in its
    /// headers.
    #[must_use]
    pub fn bcc(mut self, addresses: impl Into<String>) -> Self {
        self.bcc.push(addresses.into());
        self
    }

    /// Adds Reply-To addresses.
    #[must_use]
    pub fn reply_to(mut self, addresses: impl Into<String>) -> Self {
        self.reply_to.push(addresses.into());
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets an extra header, overriding any generated header of the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Sets the body and its content type (e.g. `text/plain`).
    #[must_use]
    pub fn body(mut self, content: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.body = content.into();
        self.content_type = content_type.into();
        self
    }

    /// Sets the body charset.
    #[must_use]
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Forces the body transfer encoding.
    #[must_use]
    pub const fn transfer_encoding(mut self, encoding: TransferEncoding) -> Self {
        self.transfer_encoding = Some(encoding);
        self
    }

    /// Sets the Date header instead of the current time.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Attaches in-memory content.
    #[must_use]
    pub fn attach(
        mut self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        self.attachments.push(AttachmentPart {
            name: name.into(),
            content_type: content_type.into(),
            content: content.into(),
        });
        self
    }

    /// Attaches a file, guessing its content type from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn attach_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|source| Error::Attachment {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let content_type = guess_content_type(&name);
        Ok(self.attach(name, content_type, content))
    }

    /// Renders the message.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is invalid, there are no recipients,
    /// the body content type is malformed, or the body cannot be represented
    /// in the chosen charset.
    pub fn build(self) -> Result<OutgoingMessage> {
        let from = self.from.as_deref().map(Address::parse).transpose()?;
        let to = parse_all(&self.to)?;
        let cc = parse_all(&self.cc)?;
        let bcc = parse_all(&self.bcc)?;
        let reply_to = parse_all(&self.reply_to)?;

        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            return Err(Error::MissingHeader("To".to_string()));
        }

        let date = self.date.unwrap_or_else(Utc::now);
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let stamp = date.timestamp_nanos_opt().unwrap_or_default();
        let domain = from
            .as_ref()
            .and_then(|a| a.email.split_once('@').map(|(_, d)| d.to_string()))
            .unwrap_or_else(|| "localhost".to_string());

        let mut headers = Headers::new();
        headers.add("Date", date.to_rfc2822());
        if let Some(from) = &from {
            headers.add("From", from.to_header_value());
        }
        for (name, list) in [("To", &to), ("Cc", &cc), ("Reply-To", &reply_to)] {
            if !list.is_empty() {
                headers.add(name, format_address_list(list));
            }
        }
        headers.add("Message-ID", format!("<{stamp:x}.{sequence}@{domain}>"));
        if let Some(subject) = &self.subject {
            headers.add("Subject", Headers::encode_value(subject));
        }
        headers.add("MIME-Version", "1.0");

        let body_type = ContentType::parse(&self.content_type)?;
        let body_type = if body_type.is_text() {
            body_type.with_parameter("charset", self.charset.as_str())
        } else {
            body_type
        };
        let raw_body = encode_charset(&self.body, &self.charset)?;
        let encoding = self
            .transfer_encoding
            .unwrap_or_else(|| default_encoding(&raw_body));
        let body = encode_body(&raw_body, encoding);

        let mut data = Vec::new();
        if self.attachments.is_empty() {
            headers.add("Content-Type", body_type.to_string());
            headers.add("Content-Transfer-Encoding", encoding.to_string());
            apply_overrides(&mut headers, &self.headers);
            data.extend_from_slice(headers.to_string().as_bytes());
            data.extend_from_slice(b"\r\n");
            data.extend_from_slice(&body);
        } else {
            let boundary = format!("=_mailconn_{stamp:x}_{sequence}");
            headers.add(
                "Content-Type",
                ContentType::multipart_mixed(boundary.as_str()).to_string(),
            );
            apply_overrides(&mut headers, &self.headers);
            data.extend_from_slice(headers.to_string().as_bytes());
            data.extend_from_slice(b"\r\nThis is a multi-part message in MIME format.\r\n");

            let mut body_part = Headers::new();
            body_part.add("Content-Type", body_type.to_string());
            body_part.add("Content-Transfer-Encoding", encoding.to_string());
            push_part(&mut data, &boundary, &body_part, &body);

            for attachment in &self.attachments {
                let name = encode_rfc2047(&attachment.name, "utf-8");
                let content_type = ContentType::parse(&attachment.content_type)
                    .unwrap_or_else(|_| ContentType::new("application", "octet-stream"))
                    .with_parameter("name", name.as_str());
                let mut part = Headers::new();
                part.add("Content-Type", content_type.to_string());
                part.add(
                    "Content-Disposition",
                    format!("attachment; filename=\"{}\"", name.replace('"', "\\\"")),
                );
                part.add("Content-Transfer-Encoding", "base64");
                let encoded = encode_base64_lines(&attachment.content);
                push_part(&mut data, &boundary, &part, encoded.as_bytes());
            }

            data.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        }

        let mut recipients: Vec<String> = Vec::new();
        for address in to.iter().chain(&cc).chain(&bcc) {
            if !recipients.iter().any(|r| r.eq_ignore_ascii_case(&address.email)) {
                recipients.push(address.email.clone());
            }
        }

        Ok(OutgoingMessage {
            sender: from.map(|a| a.email),
            recipients,
            data,
        })
    }
}

fn parse_all(lists: &[String]) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    for list in lists {
        out.extend(parse_address_list(list)?);
    }
    Ok(out)
}

fn apply_overrides(headers: &mut Headers, overrides: &Headers) {
    for (name, value) in overrides.iter() {
        headers.set(name, value);
    }
}

fn push_part(data: &mut Vec<u8>, boundary: &str, headers: &Headers, body: &[u8]) {
    data.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    data.extend_from_slice(headers.to_string().as_bytes());
    data.extend_from_slice(b"\r\n");
    data.extend_from_slice(body);
    data.extend_from_slice(b"\r\n");
}

fn default_encoding(body: &[u8]) -> TransferEncoding {
    let short_lines = body
        .split(|&b| b == b'\n')
        .all(|line| line.len() <= MAX_RAW_LINE);
    if body.is_ascii() && short_lines {
        TransferEncoding::SevenBit
    } else {
        TransferEncoding::QuotedPrintable
    }
}

fn encode_body(body: &[u8], encoding: TransferEncoding) -> Vec<u8> {
    match encoding {
        TransferEncoding::Base64 => encode_base64_lines(body).into_bytes(),
        TransferEncoding::QuotedPrintable => encode_quoted_printable_bytes(body).into_bytes(),
        TransferEncoding::SevenBit | TransferEncoding::EightBit | TransferEncoding::Binary => {
            normalize_line_endings(body)
        }
    }
}

fn normalize_line_endings(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for (i, line) in body.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(line.strip_suffix(b"\r").unwrap_or(line));
    }
    out
}

/// Guesses a content type from a file name's extension.
#[must_use]
pub fn guess_content_type(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" => "text/plain",
        "htm" | "html" => "text/html",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn text(message: &OutgoingMessage) -> String {
        String::from_utf8(message.data.clone()).unwrap()
    }

    #[test]
    fn test_simple_message() {
        let message = MessageBuilder::new()
            .from("Sender <sender@example.com>")
            .to("a@example.com, b@example.com")
            .subject("Hello")
            .body("Hi there", "text/plain")
            .build()
            .unwrap();

        assert_eq!(message.sender.as_deref(), Some("sender@example.com"));
        assert_eq!(message.recipients, vec!["a@example.com", "b@example.com"]);

        let rendered = text(&message);
        assert!(rendered.contains("To: a@example.com, b@example.com\r\n"));
        assert!(rendered.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(rendered.contains("Content-Transfer-Encoding: 7bit\r\n"));
        assert!(rendered.contains("MIME-Version: 1.0\r\n"));
        assert!(rendered.contains("Message-ID: <"));
        assert!(rendered.ends_with("\r\n\r\nHi there"));
    }

    #[test]
    fn test_default_body_is_html() {
        let message = MessageBuilder::new()
            .to("a@example.com")
            .body("<b>x</b>", "text/html")
            .build()
            .unwrap();
        assert!(text(&message).contains("Content-Type: text/html; charset=UTF-8"));
        assert!(message.sender.is_none());

        let message = MessageBuilder::new().to("a@example.com").build().unwrap();
        assert!(text(&message).contains("Content-Type: text/html"));
    }

    #[test]
    fn test_bcc_is_envelope_only() {
        let message = MessageBuilder::new()
            .to("a@example.com")
            .cc("c@example.com")
            .bcc("hidden@example.com, A@example.com")
            .build()
            .unwrap();

        assert_eq!(
            message.recipients,
            vec!["a@example.com", "c@example.com", "hidden@example.com"]
        );
        let rendered = text(&message);
        assert!(!rendered.contains("hidden@example.com"));
        assert!(!rendered.to_ascii_lowercase().contains("bcc:"));
    }

    #[test]
    fn test_requires_recipient() {
        let result = MessageBuilder::new().from("a@example.com").build();
        assert!(matches!(result, Err(Error::MissingHeader(_))));
    }

    #[test]
    fn test_rejects_invalid_address() {
        let result = MessageBuilder::new().to("not an address").build();
        assert!(matches!(result, Err(Error::InvalidAddress { .. })));
    }

    #[test]
    fn test_non_ascii_subject_and_body() {
        let message = MessageBuilder::new()
            .to("a@example.com")
            .subject("Grüße")
            .body("Grüße aus Köln", "text/plain")
            .build()
            .unwrap();

        let rendered = text(&message);
        assert!(rendered.contains("Subject: =?utf-8?B?"));
        assert!(rendered.contains("Content-Transfer-Encoding: quoted-printable"));

        let parsed = Message::parse(&message.data).unwrap();
        assert_eq!(parsed.subject().as_deref(), Some("Grüße"));
        assert_eq!(
            parsed.text_body("plain").unwrap().as_deref(),
            Some("Grüße aus Köln")
        );
    }

    #[test]
    fn test_latin1_charset() {
        let message = MessageBuilder::new()
            .to("a@example.com")
            .body("café", "text/plain")
            .charset("ISO-8859-1")
            .transfer_encoding(TransferEncoding::QuotedPrintable)
            .build()
            .unwrap();

        assert!(text(&message).contains("caf=E9"));
        let parsed = Message::parse(&message.data).unwrap();
        assert_eq!(parsed.text_body("plain").unwrap().as_deref(), Some("café"));
    }

    #[test]
    fn test_attachments_make_multipart() {
        let message = MessageBuilder::new()
            .from("sender@example.com")
            .to("a@example.com")
            .subject("Report")
            .body("See attached", "text/plain")
            .attach("report.pdf", "application/pdf", b"%PDF-1.4".to_vec())
            .attach("notes.txt", "text/plain", "plain notes")
            .build()
            .unwrap();

        let parsed = Message::parse(&message.data).unwrap();
        assert!(parsed.root().content_type().is("multipart", "mixed"));
        assert_eq!(parsed.text_body("plain").unwrap().as_deref(), Some("See attached"));

        let attachments = parsed.attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].filename().as_deref(), Some("report.pdf"));
        assert_eq!(attachments[0].decoded_body().unwrap(), b"%PDF-1.4");
        assert_eq!(attachments[1].filename().as_deref(), Some("notes.txt"));
        assert_eq!(attachments[1].body_text().unwrap(), "plain notes");
    }

    #[test]
    fn test_custom_header_overrides() {
        let message = MessageBuilder::new()
            .to("a@example.com")
            .header("Message-ID", "<fixed@example.com>")
            .header("X-Mailer", "mailconn")
            .build()
            .unwrap();

        let parsed = Message::parse(&message.data).unwrap();
        assert_eq!(parsed.message_id(), Some("<fixed@example.com>"));
        assert_eq!(parsed.headers().get_all("message-id").len(), 1);
        assert_eq!(parsed.headers().get("x-mailer"), Some("mailconn"));
    }

    #[test]
    fn test_fixed_date() {
        let date = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let message = MessageBuilder::new()
            .to("a@example.com")
            .date(date)
            .build()
            .unwrap();

        let parsed = Message::parse(&message.data).unwrap();
        assert_eq!(parsed.date().unwrap().with_timezone(&Utc), date);
    }

    #[test]
    fn test_attach_file() {
        let path = std::env::temp_dir().join(format!("mailconn-attach-{}.csv", std::process::id()));
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let message = MessageBuilder::new()
            .to("a@example.com")
            .attach_file(&path)
            .unwrap()
            .build()
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let parsed = Message::parse(&message.data).unwrap();
        let attachment = parsed.attachments()[0];
        assert!(attachment.content_type().is("text", "csv"));
        assert_eq!(attachment.decoded_body().unwrap(), b"a,b\n1,2\n");
    }

    #[test]
    fn test_attach_missing_file() {
        let result = MessageBuilder::new().attach_file("/nonexistent/mailconn/file.bin");
        assert!(matches!(result, Err(Error::Attachment { .. })));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a.PDF"), "application/pdf");
        assert_eq!(guess_content_type("photo.jpeg"), "image/jpeg");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }
}
