// ABOUTME: Message envelopes delivered by the backing store's notification transport
// ABOUTME: Change kinds, naming convention and type-tag parsing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NotifierError;

const START_SUFFIX: &str = "StartMessage";
const END_SUFFIX: &str = "EndMessage";

/// The kind of row change a record describes.
///
/// `None` marks a heartbeat cycle: a start/end pair with no entity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    None,
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::None => "None",
            ChangeKind::Insert => "Insert",
            ChangeKind::Update => "Update",
            ChangeKind::Delete => "Delete",
        }
    }

    /// Decode a kind token, ignoring case and surrounding whitespace.
    pub fn parse_token(token: &str) -> Result<Self, NotifierError> {
        let trimmed = token.trim();
        [
            ChangeKind::None,
            ChangeKind::Insert,
            ChangeKind::Update,
            ChangeKind::Delete,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
        .ok_or_else(|| NotifierError::UnknownChangeKind(trimmed.to_string()))
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ChangeKind::None)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = NotifierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ChangeKind::parse_token(value)
    }
}

/// One unit delivered by the transport: a type tag and a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub type_tag: String,
    pub payload: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(type_tag: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Payload bytes, with an absent payload read as empty.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

/// Names of the backing-store objects and message types for one conversation.
///
/// Every message type is prefixed with the convention name, so envelopes of
/// different conversations sharing a store never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamingConvention {
    name: String,
}

impl NamingConvention {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Derive a fresh convention name for a table: `cn_<table>_<8 hex>`.
    pub fn generate(table: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let base: String = table
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .take(40)
            .collect();
        Self::new(format!("cn_{}_{}", base, &suffix[..8]))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_signature(&self) -> String {
        format!("{}/{}", self.name, START_SUFFIX)
    }

    pub fn end_signature(&self) -> String {
        format!("{}/{}", self.name, END_SUFFIX)
    }

    /// Type tag carrying one column value of a record of the given kind.
    pub fn column_tag(&self, kind: ChangeKind, column: &str) -> String {
        format!("{}/{}/{}", self.name, kind, column)
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A column message tag split into its kind token and recipient column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnTag<'a> {
    pub kind_token: &'a str,
    pub recipient: &'a str,
}

impl<'a> ColumnTag<'a> {
    /// Split `<prefix…>/<kind>/<recipient>`: the last segment is the
    /// recipient column and the segment before it the kind token.
    pub fn parse(tag: &'a str) -> Result<Self, NotifierError> {
        let (head, recipient) = tag
            .rsplit_once('/')
            .ok_or_else(|| NotifierError::MalformedTypeTag(tag.to_string()))?;
        let kind_token = head.rsplit('/').next().unwrap_or(head);
        if recipient.is_empty() || kind_token.is_empty() {
            return Err(NotifierError::MalformedTypeTag(tag.to_string()));
        }
        Ok(Self {
            kind_token,
            recipient,
        })
    }
}
