//! Message flags consulted by mailbox filters and changed by flag updates.
//!
//! Only the system flags mailbox queries can filter on get their own
//! variant. Every other flag a server reports, `\Flagged` and `\Draft`
//! included, is carried verbatim as a keyword so it survives a round trip.

use std::collections::BTreeSet;
use std::fmt;

/// A flag on a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// `\Seen`: the message has been read.
    Seen,
    /// `\Answered`: a reply has been sent.
    Answered,
    /// `\Deleted`: removed on the next expunge.
    Deleted,
    /// `\Recent`: first session to see the message. Servers set it.
    Recent,
    /// Any other flag, by its wire name.
    Keyword(String),
}

static SYSTEM: [(Flag, &str); 4] = [
    (Flag::Seen, "\\Seen"),
    (Flag::Answered, "\\Answered"),
    (Flag::Deleted, "\\Deleted"),
    (Flag::Recent, "\\Recent"),
];

impl Flag {
    /// Maps a wire name to a flag. System names match case-insensitively.
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        SYSTEM
            .iter()
            .find(|(_, wire)| wire.eq_ignore_ascii_case(name))
            .map_or_else(|| Self::Keyword(name.to_string()), |(flag, _)| flag.clone())
    }

    /// Name sent to the server.
    #[must_use]
    pub fn wire_name(&self) -> &str {
        match self {
            Self::Keyword(name) => name,
            system => SYSTEM[usize::from(system.bit().unwrap_or_default())].1,
        }
    }

    const fn bit(&self) -> Option<u8> {
        match self {
            Self::Seen => Some(0),
            Self::Answered => Some(1),
            Self::Deleted => Some(2),
            Self::Recent => Some(3),
            Self::Keyword(_) => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The flags on one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    system: u8,
    keywords: BTreeSet<String>,
}

impl Flags {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding one flag.
    #[must_use]
    pub fn single(flag: Flag) -> Self {
        let mut flags = Self::new();
        flags.insert(flag);
        flags
    }

    /// Adds a flag.
    pub fn insert(&mut self, flag: Flag) {
        match (flag.bit(), flag) {
            (Some(bit), _) => self.system |= 1 << bit,
            (None, Flag::Keyword(name)) => {
                self.keywords.insert(name);
            }
            (None, _) => {}
        }
    }

    /// Removes a flag.
    pub fn remove(&mut self, flag: &Flag) {
        match (flag.bit(), flag) {
            (Some(bit), _) => self.system &= !(1 << bit),
            (None, Flag::Keyword(name)) => {
                self.keywords.remove(name);
            }
            (None, _) => {}
        }
    }

    /// Sets every flag in `other`, or clears them when `set` is false.
    pub fn apply(&mut self, other: &Self, set: bool) {
        if set {
            self.system |= other.system;
            self.keywords.extend(other.keywords.iter().cloned());
        } else {
            self.system &= !other.system;
            self.keywords.retain(|k| !other.keywords.contains(k));
        }
    }

    /// Returns true if the flag is present.
    #[must_use]
    pub fn contains(&self, flag: &Flag) -> bool {
        match (flag.bit(), flag) {
            (Some(bit), _) => self.system & (1 << bit) != 0,
            (None, Flag::Keyword(name)) => self.keywords.contains(name),
            (None, _) => false,
        }
    }

    /// Returns true if the message has been read.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.contains(&Flag::Seen)
    }

    /// Returns true if the message will be removed on expunge.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.contains(&Flag::Deleted)
    }

    /// Wire names of the flags, system flags first.
    pub fn wire_names(&self) -> impl Iterator<Item = &str> {
        SYSTEM
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.system & (1 << bit) != 0)
            .map(|(_, (_, wire))| *wire)
            .chain(self.keywords.iter().map(String::as_str))
    }

    /// Number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.system.count_ones() as usize + self.keywords.len()
    }

    /// Returns true if there are no flags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.system == 0 && self.keywords.is_empty()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        let mut flags = Self::new();
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, name) in self.wire_names().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
        }
        f.write_str(")")
    }
}
