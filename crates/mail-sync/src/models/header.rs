//! Message headers: the per-message summary shown in message lists

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Well-known flag names
pub mod flags {
    pub const SEEN: &str = "\\Seen";
    pub const FLAGGED: &str = "\\Flagged";
    pub const ANSWERED: &str = "\\Answered";
    pub const DRAFT: &str = "\\Draft";
}

/// Identifier the server uses for a message (IMAP UID, ActiveSync ServerId)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a message in listing order.
///
/// Keys order newest first: a smaller key is a newer message. Messages with
/// the same date fall back to the higher local id first, which makes the
/// order total within a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub date: i64,
    pub id: u64,
}

impl SortKey {
    pub fn new(date: i64, id: u64) -> Self {
        Self { date, id }
    }

    /// True when `self` sorts before (is younger than) `other`
    pub fn is_newer_than(&self, other: &SortKey) -> bool {
        self < other
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .date
            .cmp(&self.date)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Anything stored in a block: it must know its own position
pub trait Keyed {
    fn sort_key(&self) -> SortKey;
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// Parse `"Name <addr>"` or a bare address
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match (s.rfind('<'), s.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let name = s[..open].trim().trim_matches('"').trim();
                Self {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    address: s[open + 1..close].trim().to_string(),
                }
            }
            _ => Self::new(s),
        }
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Summary of a message as listed in a folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderInfo {
    /// Folder-local id, allocated from the folder's header counter
    pub id: u64,
    pub server_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub author: EmailAddress,
    /// Milliseconds since the epoch
    pub date: i64,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl HeaderInfo {
    pub fn builder(id: u64, server_id: impl Into<ServerId>) -> HeaderBuilder {
        HeaderBuilder::new(id, server_id.into())
    }

    /// Build a stored header from what the server reported
    pub fn from_remote(id: u64, remote: RemoteHeader) -> Self {
        Self {
            id,
            server_id: remote.server_id,
            conversation_id: remote.conversation_id,
            author: remote.author,
            date: remote.date,
            flags: remote.flags,
            has_attachments: remote.has_attachments,
            subject: remote.subject,
            snippet: remote.snippet,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_read(&self) -> bool {
        self.has_flag(flags::SEEN)
    }
}

impl Keyed for HeaderInfo {
    fn sort_key(&self) -> SortKey {
        SortKey::new(self.date, self.id)
    }
}

/// A header as reported by the server, before a local id is assigned
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHeader {
    pub server_id: ServerId,
    pub conversation_id: Option<String>,
    pub author: EmailAddress,
    pub date: i64,
    pub flags: BTreeSet<String>,
    pub has_attachments: bool,
    pub subject: String,
    pub snippet: Option<String>,
}

/// Builder for HeaderInfo, mostly used by tests and fake servers
pub struct HeaderBuilder {
    header: HeaderInfo,
}

impl HeaderBuilder {
    fn new(id: u64, server_id: ServerId) -> Self {
        Self {
            header: HeaderInfo {
                id,
                server_id,
                conversation_id: None,
                author: EmailAddress::default(),
                date: 0,
                flags: BTreeSet::new(),
                has_attachments: false,
                subject: String::new(),
                snippet: None,
            },
        }
    }

    pub fn date(mut self, date: i64) -> Self {
        self.header.date = date;
        self
    }

    pub fn author(mut self, author: EmailAddress) -> Self {
        self.header.author = author;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.header.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.header.snippet = Some(snippet.into());
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.header.flags.insert(flag.into());
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.header.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn has_attachments(mut self, has_attachments: bool) -> Self {
        self.header.has_attachments = has_attachments;
        self
    }

    pub fn build(self) -> HeaderInfo {
        self.header
    }
}
