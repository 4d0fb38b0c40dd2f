//! MIME message structure and parsing.

use crate::address::{Address, parse_address_list};
use crate::content_type::{ContentType, split_parameters, unquote};
use crate::encoding::{decode_base64, decode_charset, decode_quoted_printable, decode_rfc2047};
use crate::error::{Error, Result};
use crate::header::Headers;
use chrono::{DateTime, FixedOffset};
use std::fmt;

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    #[default]
    SevenBit,
    /// 8-bit text.
    EightBit,
    /// Base64 encoding.
    Base64,
    /// Quoted-Printable encoding.
    QuotedPrintable,
    /// Binary (no encoding).
    Binary,
}

impl TransferEncoding {
    /// Parses transfer encoding from string; unknown values mean 7bit.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "8bit" => Self::EightBit,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            "binary" => Self::Binary,
            _ => Self::SevenBit,
        }
    }

    /// Decodes a body encoded with this transfer encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid for the encoding.
    pub fn decode(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Base64 => decode_base64(&String::from_utf8_lossy(body)),
            Self::QuotedPrintable => decode_quoted_printable(&String::from_utf8_lossy(body)),
            Self::SevenBit | Self::EightBit | Self::Binary => Ok(body.to_vec()),
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
            Self::Binary => "binary",
        })
    }
}

/// Content-Disposition of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    /// `inline`, `attachment`, or another token, lowercased.
    pub kind: String,
    /// The `filename` parameter, decoded.
    pub filename: Option<String>,
}

impl Disposition {
    /// Parses a Content-Disposition value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut segments = split_parameters(value).into_iter();
        let kind = segments.next().unwrap_or_default().to_ascii_lowercase();
        let filename = segments.find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("filename")
                .then(|| decode_word(&unquote(value.trim())))
        });
        Self { kind, filename }
    }

    /// Returns `true` for `attachment` dispositions.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.kind == "attachment"
    }
}

fn decode_word(value: &str) -> String {
    decode_rfc2047(value).unwrap_or_else(|_| value.to_string())
}

/// Body of a MIME entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Raw, still transfer-encoded, content of a leaf entity.
    Leaf(Vec<u8>),
    /// Child entities of a multipart entity.
    Multipart(Vec<Entity>),
}

/// A MIME entity: headers plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Entity headers.
    pub headers: Headers,
    /// Entity body.
    pub body: Body,
}

impl Entity {
    /// Parses an entity from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if headers are malformed or a multipart entity has
    /// no boundary.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (head, body) = split_head(raw);
        let headers = Headers::parse(&String::from_utf8_lossy(head))?;
        let content_type = content_type_of(&headers);

        let body = if content_type.is_multipart() {
            let boundary = content_type.boundary().ok_or(Error::MissingBoundary)?;
            let parts = split_multipart(body, boundary)?
                .into_iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>>>()?;
            Body::Multipart(parts)
        } else {
            Body::Leaf(body.to_vec())
        };

        Ok(Self { headers, body })
    }

    /// Gets the content type, falling back to the RFC 2045 default.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        content_type_of(&self.headers)
    }

    /// Gets the transfer encoding.
    #[must_use]
    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.headers
            .get("content-transfer-encoding")
            .map_or(TransferEncoding::SevenBit, TransferEncoding::parse)
    }

    /// Gets the Content-Disposition, if present.
    #[must_use]
    pub fn disposition(&self) -> Option<Disposition> {
        self.headers.get("content-disposition").map(Disposition::parse)
    }

    /// Gets the file name from the disposition or the content type.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        self.disposition()
            .and_then(|d| d.filename)
            .or_else(|| self.content_type().name().map(decode_word))
    }

    /// Returns `true` if this entity is an attachment rather than body text.
    ///
    /// Explicit `attachment` dispositions, named parts, and non-text leaves
    /// all count.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        if matches!(self.body, Body::Multipart(_)) {
            return false;
        }
        self.disposition().is_some_and(|d| d.is_attachment())
            || self.filename().is_some()
            || !self.content_type().is_text()
    }

    /// Decodes the body according to the transfer encoding.
    ///
    /// # Errors
    ///
    /// Returns an error for multipart entities or if decoding fails.
    pub fn decoded_body(&self) -> Result<Vec<u8>> {
        match &self.body {
            Body::Leaf(raw) => self.transfer_encoding().decode(raw),
            Body::Multipart(_) => Err(Error::InvalidMultipart(
                "multipart entity has no single body".to_string(),
            )),
        }
    }

    /// Gets the decoded body as text in the declared charset.
    ///
    /// # Errors
    ///
    /// Returns an error for multipart entities or if decoding fails.
    pub fn body_text(&self) -> Result<String> {
        let bytes = self.decoded_body()?;
        let content_type = self.content_type();
        Ok(decode_charset(&bytes, content_type.charset().unwrap_or("us-ascii")))
    }

    /// Returns the leaf entities of this entity, depth first.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Self> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Self>) {
        match &self.body {
            Body::Leaf(_) => out.push(self),
            Body::Multipart(parts) => {
                for part in parts {
                    part.collect_leaves(out);
                }
            }
        }
    }
}

fn content_type_of(headers: &Headers) -> ContentType {
    headers
        .get("content-type")
        .and_then(|v| ContentType::parse(v).ok())
        .unwrap_or_default()
}

/// Splits raw bytes at the first blank line.
fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    if raw.starts_with(b"\r\n") {
        return (&raw[..0], &raw[2..]);
    }
    if raw.starts_with(b"\n") {
        return (&raw[..0], &raw[1..]);
    }
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(raw, b"\n\n").map(|i| (i, i + 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    split.map_or((raw, &raw[raw.len()..]), |(end, start)| (&raw[..end], &raw[start..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a multipart body into the raw bytes of each part.
///
/// The preamble before the first delimiter and the epilogue after the closing
/// delimiter are discarded.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut closed = false;
    let mut offset = 0;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let start = offset;
        offset += line.len();

        let trimmed = trim_line_end(line);
        let Some(rest) = trimmed.strip_prefix(delimiter.as_bytes()) else {
            continue;
        };
        let is_close = rest.starts_with(b"--");
        if !is_close && !rest.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        if let Some(begin) = current.take() {
            parts.push(strip_trailing_newline(&body[begin..start]));
        }
        if is_close {
            closed = true;
            break;
        }
        current = Some(offset);
    }

    // A missing close delimiter still yields the last part.
    if !closed && let Some(begin) = current {
        parts.push(&body[begin..]);
    }

    if parts.is_empty() {
        return Err(Error::InvalidMultipart(format!(
            "no parts delimited by boundary {boundary}"
        )));
    }
    Ok(parts)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The CRLF preceding a delimiter belongs to the delimiter.
fn strip_trailing_newline(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}

/// A parsed MIME message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    root: Entity,
}

impl Message {
    /// Parses a complete RFC 5322 message.
    ///
    /// # Errors
    ///
    /// Returns an error if the headers or MIME structure are malformed.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Entity::parse(raw).map(|root| Self { root })
    }

    /// Returns the root entity.
    #[must_use]
    pub const fn root(&self) -> &Entity {
        &self.root
    }

    /// Returns the top-level headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.root.headers
    }

    /// Gets the decoded Subject header.
    #[must_use]
    pub fn subject(&self) -> Option<String> {
        self.headers().get_decoded("subject")
    }

    /// Gets the Message-ID header.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers().get("message-id")
    }

    /// Gets the Date header.
    #[must_use]
    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.headers()
            .get("date")
            .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
    }

    /// Parses every address in the named headers (e.g. `To`).
    ///
    /// Header values that fail to parse are skipped.
    #[must_use]
    pub fn addresses(&self, name: &str) -> Vec<Address> {
        self.headers()
            .get_all(name)
            .into_iter()
            .flat_map(|value| parse_address_list(value).unwrap_or_default())
            .collect()
    }

    /// Gets the first From address.
    #[must_use]
    pub fn from(&self) -> Option<Address> {
        self.addresses("from").into_iter().next()
    }

    /// Returns every leaf entity, depth first.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Entity> {
        self.root.leaves()
    }

    /// Finds the first inline leaf of the given text subtype and decodes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the matching part cannot be decoded.
    pub fn text_body(&self, sub_type: &str) -> Result<Option<String>> {
        self.leaves()
            .into_iter()
            .find(|e| {
                e.content_type().is("text", sub_type)
                    && !e.disposition().is_some_and(|d| d.is_attachment())
            })
            .map(Entity::body_text)
            .transpose()
    }

    /// Returns the leaves that are attachments.
    #[must_use]
    pub fn attachments(&self) -> Vec<&Entity> {
        let bodies = [self.first_inline("plain"), self.first_inline("html")];
        self.leaves()
            .into_iter()
            .filter(|e| e.is_attachment() && !bodies.iter().flatten().any(|b| std::ptr::eq(*b, *e)))
            .collect()
    }

    fn first_inline(&self, sub_type: &str) -> Option<&Entity> {
        self.leaves().into_iter().find(|e| {
            e.content_type().is("text", sub_type)
                && !e.disposition().is_some_and(|d| d.is_attachment())
        })
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

    const MULTIPART: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: bob@example.com, \"Carol C\" <carol@example.com>\r\n",
        "Subject: =?utf-8?B?SMOpbGxv?=\r\n",
        "Date: Tue, 1 Jul 2025 10:52:37 +0200\r\n",
        "Message-ID: <abc@example.com>\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "preamble\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=inner\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "Content-Transfer-Encoding: quoted-printable\r\n",
        "\r\n",
        "H=C3=A9llo\r\n",
        "--inner\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>Hi</p>\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf; name=report.pdf\r\n",
        "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "JVBERi0=\r\n",
        "--outer--\r\n",
        "epilogue\r\n",
    );

    #[test]
    fn test_transfer_encoding_parse() {
        assert_eq!(TransferEncoding::parse("7bit"), TransferEncoding::SevenBit);
        assert_eq!(TransferEncoding::parse("BASE64"), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::parse("quoted-printable"),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::parse("x-unknown"), TransferEncoding::SevenBit);
    }

    #[test]
    fn test_single_part() {
        let raw = b"From: sender@example.com\r\nSubject: Test\r\n\r\nHello, World!";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.from().unwrap().email, "sender@example.com");
        assert_eq!(message.subject().as_deref(), Some("Test"));
        assert_eq!(message.text_body("plain").unwrap().as_deref(), Some("Hello, World!"));
        assert!(message.attachments().is_empty());
    }

    #[test]
    fn test_bare_lf_message() {
        let raw = b"Subject: lf\n\nline one\nline two\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(
            message.text_body("plain").unwrap().as_deref(),
            Some("line one\nline two\n")
        );
    }

    #[test]
    fn test_nested_multipart() {
        let message = Message::parse(MULTIPART.as_bytes()).unwrap();

        assert_eq!(message.subject().as_deref(), Some("Héllo"));
        assert_eq!(message.message_id(), Some("<abc@example.com>"));
        assert!(message.date().is_some());

        let to: Vec<String> = message.addresses("to").into_iter().map(|a| a.email).collect();
        assert_eq!(to, vec!["bob@example.com", "carol@example.com"]);

        assert_eq!(message.leaves().len(), 3);
        assert_eq!(message.text_body("plain").unwrap().as_deref(), Some("Héllo"));
        assert_eq!(message.text_body("html").unwrap().as_deref(), Some("<p>Hi</p>"));

        let attachments = message.attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename().as_deref(), Some("report.pdf"));
        assert_eq!(attachments[0].decoded_body().unwrap(), b"%PDF-");
    }

    #[test]
    fn test_multipart_without_boundary() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\nbody";
        assert!(matches!(Message::parse(raw), Err(Error::MissingBoundary)));
    }

    #[test]
    fn test_multipart_without_close_delimiter() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\n\r\nonly part\r\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(message.leaves().len(), 1);
        assert_eq!(message.leaves()[0].body_text().unwrap(), "only part\r\n");
    }

    #[test]
    fn test_disposition_parse() {
        let d = Disposition::parse("Attachment; filename=\"=?utf-8?B?SMOpbGxv?=.txt\"");
        assert!(d.is_attachment());
        assert_eq!(d.filename.as_deref(), Some("Héllo.txt"));

        let d = Disposition::parse("inline");
        assert!(!d.is_attachment());
        assert!(d.filename.is_none());
    }
}
