//! Message bodies: recipients, attachments and renderable content

use serde::{Deserialize, Serialize};

use super::{EmailAddress, Keyed, SortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyRepKind {
    Plain,
    Html,
}

/// One renderable part of a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyRep {
    pub kind: BodyRepKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub name: String,
    pub mime_type: String,
    /// MIME part number on the server, if the body was fetched lazily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    pub size_estimate: usize,
}

/// Full body of a message, stored separately from its header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyInfo {
    /// Local id of the header this body belongs to
    pub id: u64,
    /// Same date as the header, so both families sort identically
    pub date: i64,
    /// Estimated stored size in bytes, used for block sizing
    pub size: usize,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EmailAddress>,
    #[serde(default)]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(default)]
    pub body_reps: Vec<BodyRep>,
}

impl BodyInfo {
    pub fn new(id: u64, date: i64, size: usize) -> Self {
        Self {
            id,
            date,
            size,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            attachments: Vec::new(),
            body_reps: Vec::new(),
        }
    }

    pub fn with_rep(mut self, kind: BodyRepKind, content: impl Into<String>) -> Self {
        self.body_reps.push(BodyRep {
            kind,
            content: content.into(),
        });
        self
    }

    /// Build a stored body for the header `id` from what the server sent
    pub fn from_remote(id: u64, date: i64, remote: RemoteBody) -> Self {
        Self {
            id,
            date,
            size: remote.size,
            to: remote.to,
            cc: remote.cc,
            bcc: remote.bcc,
            reply_to: remote.reply_to,
            attachments: remote.attachments,
            body_reps: remote.body_reps,
        }
    }

    /// Plain text content, if there is any
    pub fn plain_text(&self) -> Option<&str> {
        self.body_reps
            .iter()
            .find(|rep| rep.kind == BodyRepKind::Plain)
            .map(|rep| rep.content.as_str())
    }
}

impl Keyed for BodyInfo {
    fn sort_key(&self) -> SortKey {
        SortKey::new(self.date, self.id)
    }
}

/// A body as the server delivered it, before it is tied to a local header
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteBody {
    pub size: usize,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub attachments: Vec<AttachmentInfo>,
    pub body_reps: Vec<BodyRep>,
}
