//! Transfer and header encodings.
//!
//! Base64 and Quoted-Printable (RFC 2045), plus RFC 2047 encoded words for
//! header values.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt::Write as _;

/// Maximum encoded line length for Base64 and Quoted-Printable bodies.
const MAX_LINE_LENGTH: usize = 76;

/// Largest chunk of raw text placed into a single encoded word.
const ENCODED_WORD_CHUNK: usize = 45;

/// Encodes data as Base64 on a single line.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Encodes data as Base64 folded into CRLF-separated lines.
#[must_use]
pub fn encode_base64_lines(data: &[u8]) -> String {
    let encoded = encode_base64(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / MAX_LINE_LENGTH * 2);
    for (i, chunk) in encoded.as_bytes().chunks(MAX_LINE_LENGTH).enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        // Base64 output is pure ASCII.
        out.extend(chunk.iter().map(|&b| char::from(b)));
    }
    out
}

/// Decodes Base64 data, ignoring embedded whitespace and line breaks.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(cleaned).map_err(Into::into)
}

/// Encodes text using Quoted-Printable encoding (RFC 2045).
///
/// Line breaks in the input are kept as hard CRLF breaks; long lines get
/// soft breaks.
#[must_use]
pub fn encode_quoted_printable(text: &str) -> String {
    encode_quoted_printable_bytes(text.as_bytes())
}

/// Encodes raw bytes using Quoted-Printable encoding.
#[must_use]
pub fn encode_quoted_printable_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for (i, line) in data.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        encode_quoted_printable_line(line, &mut out);
    }
    out
}

fn encode_quoted_printable_line(line: &[u8], out: &mut String) {
    let mut length = 0;
    for (i, &byte) in line.iter().enumerate() {
        let last = i + 1 == line.len();
        // Trailing whitespace must be encoded or it gets stripped in transit.
        let literal =
            matches!(byte, b'!'..=b'<' | b'>'..=b'~') || ((byte == b' ' || byte == b'\t') && !last);
        let width = if literal { 1 } else { 3 };

        if length + width > MAX_LINE_LENGTH - 1 {
            out.push_str("=\r\n");
            length = 0;
        }

        if literal {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "={byte:02X}");
        }
        length += width;
    }
}

/// Decodes Quoted-Printable text (RFC 2045) into raw bytes.
///
/// # Errors
///
/// Returns an error if the input contains invalid escape sequences.
pub fn decode_quoted_printable(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];
        if byte != b'=' {
            out.push(byte);
            i += 1;
            continue;
        }

        match bytes.get(i + 1..i + 3) {
            // Soft line breaks
            Some([b'\r', b'\n']) => i += 3,
            Some([b'\n', _]) => i += 2,
            Some(hex) => {
                let value = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        Error::InvalidEncoding(format!(
                            "Invalid escape sequence at offset {i}"
                        ))
                    })?;
                out.push(value);
                i += 3;
            }
            None if bytes.get(i + 1) == Some(&b'\n') => i += 2,
            None if i + 1 == bytes.len() => i += 1,
            None => {
                return Err(Error::InvalidEncoding(
                    "Incomplete escape sequence".to_string(),
                ));
            }
        }
    }

    Ok(out)
}

/// Converts bytes in the named charset to a string.
///
/// UTF-8 and ASCII decode lossily; the Latin-1 family maps bytes directly to
/// code points. Unknown charsets are treated as UTF-8.
#[must_use]
pub fn decode_charset(bytes: &[u8], charset: &str) -> String {
    // RFC 2231 language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.trim().to_ascii_lowercase().as_str() {
        "iso-8859-1" | "iso8859-1" | "latin1" | "windows-1252" | "cp1252" => {
            bytes.iter().map(|&b| char::from(b)).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Converts a string to bytes in the named charset.
///
/// # Errors
///
/// Returns an error if a character cannot be represented in a Latin-1
/// family charset.
pub fn encode_charset(text: &str, charset: &str) -> Result<Vec<u8>> {
    match charset.trim().to_ascii_lowercase().as_str() {
        "iso-8859-1" | "iso8859-1" | "latin1" | "windows-1252" | "cp1252" => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| {
                    Error::InvalidEncoding(format!("'{c}' is not representable in {charset}"))
                })
            })
            .collect(),
        _ => Ok(text.as_bytes().to_vec()),
    }
}

/// Encodes a header value using RFC 2047 encoded words when it is not plain
/// ASCII.
///
/// Long values are split over several encoded words separated by spaces.
#[must_use]
pub fn encode_rfc2047(text: &str, charset: &str) -> String {
    let plain = text
        .chars()
        .all(|c| (c.is_ascii() && !c.is_ascii_control()) || c == '\t');
    if plain && !text.contains("=?") {
        return text.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in text.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?{charset}?B?{}?=", encode_base64(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?{charset}?B?{}?=", encode_base64(chunk.as_bytes())));
    }
    words.join(" ")
}

/// Decodes every RFC 2047 encoded word in a header value.
///
/// Whitespace between adjacent encoded words is dropped; text that is not an
/// encoded word passes through untouched.
///
/// # Errors
///
/// Returns an error if an encoded word uses an unknown encoding or carries an
/// invalid payload.
pub fn decode_rfc2047(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        if let Some((decoded, consumed)) = parse_encoded_word(candidate)? {
            if !(after_word && before.trim().is_empty()) {
                out.push_str(before);
            }
            out.push_str(&decoded);
            rest = &candidate[consumed..];
            after_word = true;
        } else {
            out.push_str(before);
            out.push_str("=?");
            rest = &candidate[2..];
            after_word = false;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Parses one `=?charset?encoding?text?=` word at the start of `s`, returning
/// the decoded text and the number of bytes consumed.
fn parse_encoded_word(s: &str) -> Result<Option<(String, usize)>> {
    let inner = &s[2..];
    let Some((charset, after_charset)) = inner.split_once('?') else {
        return Ok(None);
    };
    let Some((encoding, after_encoding)) = after_charset.split_once('?') else {
        return Ok(None);
    };
    let Some(end) = after_encoding.find("?=") else {
        return Ok(None);
    };
    let payload = &after_encoding[..end];
    if charset.is_empty() || charset.contains(char::is_whitespace) || payload.contains(' ') {
        return Ok(None);
    }

    let bytes = match encoding {
        "B" | "b" => decode_base64(payload)?,
        "Q" | "q" => decode_quoted_printable(&payload.replace('_', " "))?,
        other => {
            return Err(Error::InvalidEncoding(format!("Unknown encoding: {other}")));
        }
    };

    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
    Ok(Some((decode_charset(&bytes, charset), consumed)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_encode_decode() {
        let encoded = encode_base64(b"Hello, World!");
        assert_eq!(encoded, "SGVsbG8sIFdvcmxkIQ==");
        assert_eq!(decode_base64(&encoded).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_base64_lines_are_folded() {
        let data = vec![0xAB_u8; 200];
        let encoded = encode_base64_lines(&data);
        assert!(encoded.lines().all(|l| l.trim_end().len() <= MAX_LINE_LENGTH));
        assert!(encoded.contains("\r\n"));
        assert_eq!(decode_base64(&encoded).unwrap(), data);
    }

    #[test]
    fn test_quoted_printable_encode() {
        assert_eq!(encode_quoted_printable("Hello, World!"), "Hello, World!");
        assert!(encode_quoted_printable("Héllo").contains("=C3=A9"));
        assert_eq!(encode_quoted_printable("a=b"), "a=3Db");
    }

    #[test]
    fn test_quoted_printable_keeps_hard_breaks() {
        assert_eq!(encode_quoted_printable("one\ntwo"), "one\r\ntwo");
        assert_eq!(encode_quoted_printable("trailing \nx"), "trailing=20\r\nx");
    }

    #[test]
    fn test_quoted_printable_soft_breaks_long_lines() {
        let line = "x".repeat(200);
        let encoded = encode_quoted_printable(&line);
        assert!(encoded.lines().all(|l| l.len() <= MAX_LINE_LENGTH));
        assert_eq!(decode_quoted_printable(&encoded).unwrap(), line.as_bytes());
    }

    #[test]
    fn test_quoted_printable_decode() {
        assert_eq!(decode_quoted_printable("H=C3=A9llo").unwrap(), "Héllo".as_bytes());
        assert_eq!(decode_quoted_printable("Hello=\r\nWorld").unwrap(), b"HelloWorld");
        assert_eq!(decode_quoted_printable("Hello=\nWorld").unwrap(), b"HelloWorld");
        assert!(decode_quoted_printable("bad=ZZ").is_err());
        assert!(decode_quoted_printable("bad=A").is_err());
    }

    #[test]
    fn test_decode_charset_latin1() {
        assert_eq!(decode_charset(&[0x48, 0xE9], "ISO-8859-1"), "Hé");
        assert_eq!(decode_charset("Hé".as_bytes(), "utf-8*en"), "Hé");
    }

    #[test]
    fn test_encode_charset() {
        assert_eq!(encode_charset("Hé", "ISO-8859-1").unwrap(), vec![0x48, 0xE9]);
        assert_eq!(encode_charset("Hé", "utf-8").unwrap(), "Hé".as_bytes());
        assert!(encode_charset("€", "latin1").is_err());
    }

    #[test]
    fn test_rfc2047_encode() {
        assert_eq!(encode_rfc2047("Hello", "utf-8"), "Hello");

        let encoded = encode_rfc2047("Héllo", "utf-8");
        assert!(encoded.starts_with("=?utf-8?B?"));
        assert!(encoded.ends_with("?="));
        assert_eq!(decode_rfc2047(&encoded).unwrap(), "Héllo");
    }

    #[test]
    fn test_rfc2047_encode_long_value_splits_words() {
        let subject = "Ünïcödé ".repeat(12);
        let encoded = encode_rfc2047(&subject, "utf-8");
        assert!(encoded.matches("=?utf-8?B?").count() > 1);
        assert_eq!(decode_rfc2047(&encoded).unwrap(), subject);
    }

    #[test]
    fn test_rfc2047_decode() {
        assert_eq!(decode_rfc2047("Hello").unwrap(), "Hello");
        assert_eq!(decode_rfc2047("=?utf-8?B?SMOpbGxv?=").unwrap(), "Héllo");
        assert_eq!(decode_rfc2047("=?utf-8?Q?H=C3=A9llo_there?=").unwrap(), "Héllo there");
    }

    #[test]
    fn test_rfc2047_decode_mixed_text() {
        let value = "Re: =?utf-8?B?SMOpbGxv?= =?utf-8?Q?_w=C3=B6rld?= again";
        assert_eq!(decode_rfc2047(value).unwrap(), "Re: Héllo wörld again");
        assert_eq!(decode_rfc2047("price =? unknown").unwrap(), "price =? unknown");
    }

    #[test]
    fn test_rfc2047_unknown_encoding() {
        assert!(decode_rfc2047("=?utf-8?X?abc?=").is_err());
    }
}
