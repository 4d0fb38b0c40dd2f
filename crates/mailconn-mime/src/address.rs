//! Mailbox addresses and address lists.

use crate::content_type::unquote;
use crate::encoding::{decode_rfc2047, encode_rfc2047};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A mailbox: optional display name plus an `local@domain` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    /// Display name, already decoded.
    pub name: Option<String>,
    /// The bare address.
    pub email: String,
}

impl Address {
    /// Creates an address without a display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn new(email: impl Into<String>) -> Result<Self> {
        let email = email.into();
        validate(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates an address with a display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Result<Self> {
        let mut address = Self::new(email)?;
        address.name = Some(name.into());
        Ok(address)
    }

    /// Parses a single mailbox in `Name <local@domain>` or bare form.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(open) = s.rfind('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| invalid(s, "unterminated angle address"))?;
            let email = s[open + 1..close].trim();
            let name = unquote(s[..open].trim());
            let name = decode_rfc2047(&name).unwrap_or(name);
            let mut address = Self::new(email).map_err(|_| invalid(s, "invalid angle address"))?;
            address.name = Some(name).filter(|n| !n.is_empty());
            Ok(address)
        } else {
            Self::new(s)
        }
    }

    /// Renders the address for a header, encoding a non-ASCII display name.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        match &self.name {
            Some(name) if !name.is_ascii() => {
                format!("{} <{}>", encode_rfc2047(name, "utf-8"), self.email)
            }
            _ => self.to_string(),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if name.contains(|c: char| "()<>@,;:\\\".[]".contains(c)) => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{escaped}\" <{}>", self.email)
            }
            Some(name) => write!(f, "{name} <{}>", self.email),
            None => f.write_str(&self.email),
        }
    }
}

fn invalid(address: &str, reason: &'static str) -> Error {
    Error::InvalidAddress {
        address: address.to_string(),
        reason,
    }
}

fn validate(addr: &str) -> Result<()> {
    if addr.is_empty() {
        return Err(invalid(addr, "address cannot be empty"));
    }
    if addr.contains(char::is_whitespace) {
        return Err(invalid(addr, "address cannot contain whitespace"));
    }

    let Some((local, domain)) = addr.split_once('@') else {
        return Err(invalid(addr, "address must contain @"));
    };
    if domain.contains('@') {
        return Err(invalid(addr, "address must have exactly one @"));
    }
    if local.is_empty() || domain.is_empty() {
        return Err(invalid(addr, "local and domain parts cannot be empty"));
    }

    Ok(())
}

/// Parses a comma-separated address list.
///
/// Commas inside quoted display names and angle brackets do not split.
/// Empty entries are skipped.
///
/// # Errors
///
/// Returns an error if any entry is invalid.
pub fn parse_address_list(s: &str) -> Result<Vec<Address>> {
    split_address_list(s)
        .into_iter()
        .map(|entry| Address::parse(&entry))
        .collect()
}

fn split_address_list(s: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut angle = false;

    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                entries.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    entries.push(current);

    entries
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Formats addresses as a header value.
#[must_use]
pub fn format_address_list(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(Address::to_header_value)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_address() {
        let addr = Address::new("user@example.com").unwrap();
        assert_eq!(addr.email, "user@example.com");
        assert_eq!(addr.to_string(), "user@example.com");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(Address::new("userexample.com").is_err());
        assert!(Address::new("").is_err());
        assert!(Address::new("@example.com").is_err());
        assert!(Address::new("user@").is_err());
        assert!(Address::new("a@b@c").is_err());
        assert!(Address::new("a b@c").is_err());
    }

    #[test]
    fn test_parse_named() {
        let addr = Address::parse("Alice Smith <alice@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Alice Smith"));
        assert_eq!(addr.email, "alice@example.com");

        let addr = Address::parse("\"Smith, Alice\" <alice@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Smith, Alice"));
        assert_eq!(addr.to_string(), "\"Smith, Alice\" <alice@example.com>");

        let addr = Address::parse("<bare@example.com>").unwrap();
        assert!(addr.name.is_none());
    }

    #[test]
    fn test_parse_encoded_name() {
        let addr = Address::parse("=?utf-8?B?SMOpbGxv?= <h@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Héllo"));
        assert!(addr.to_header_value().starts_with("=?utf-8?B?"));
    }

    #[test]
    fn test_parse_unterminated() {
        assert!(Address::parse("Alice <alice@example.com").is_err());
    }

    #[test]
    fn test_parse_list() {
        let list = parse_address_list(
            "\"Smith, Alice\" <alice@example.com>, bob@example.com,, Carol <carol@example.com>",
        )
        .unwrap();
        let emails: Vec<&str> = list.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(
            emails,
            vec!["alice@example.com", "bob@example.com", "carol@example.com"]
        );
        assert_eq!(
            format_address_list(&list),
            "\"Smith, Alice\" <alice@example.com>, bob@example.com, Carol <carol@example.com>"
        );
    }

    #[test]
    fn test_parse_list_rejects_bad_entry() {
        assert!(parse_address_list("ok@example.com, nope").is_err());
        assert!(parse_address_list("").unwrap().is_empty());
    }
}
