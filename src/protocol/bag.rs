// ABOUTME: MessageBag reassembles one logical row change out of column envelopes
// ABOUTME: Start/end sentinels delimit a record; columns are indexed by recipient name

use std::collections::HashMap;

use crate::config::TextEncoding;
use crate::error::NotifierError;
use crate::marshal::decode_text;

use super::envelope::{ChangeKind, ColumnTag, NamingConvention};

/// Reassembly state of the record currently held by a bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagStatus {
    /// A start sentinel was seen (or the bag is fresh); no column yet.
    Open,
    /// At least one column payload was recorded.
    Collecting,
    /// The end sentinel matched the open kind; the record is dispatch-ready.
    Closed,
    /// The current record failed; its remaining envelopes are skipped until the next start.
    Discarding,
}

/// A completed record taken out of a closed bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedRecord {
    pub kind: ChangeKind,
    /// Kind text exactly as decoded from the start sentinel.
    pub raw_kind: String,
    columns: HashMap<String, Option<Vec<u8>>>,
}

impl ClosedRecord {
    /// Payload recorded for a column. Exact name first, then case-insensitive.
    pub fn payload(&self, column: &str) -> Option<&[u8]> {
        let value = match self.columns.get(column) {
            Some(value) => value,
            None => {
                self.columns
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(column))?
                    .1
            }
        };
        value.as_deref()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
            || self.columns.keys().any(|name| name.eq_ignore_ascii_case(column))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Folds a stream of envelopes into one record per start/end cycle.
///
/// Any fault discards the record being assembled. The rest of that record's
/// envelopes are skipped without further faults; the next start sentinel
/// begins a clean cycle.
#[derive(Debug)]
pub struct MessageBag {
    start_signature: String,
    end_signature: String,
    encoding: TextEncoding,
    kind: Option<ChangeKind>,
    raw_kind: String,
    columns: HashMap<String, Option<Vec<u8>>>,
    status: BagStatus,
}

impl MessageBag {
    pub fn new(naming: &NamingConvention, encoding: TextEncoding) -> Self {
        Self::with_signatures(naming.start_signature(), naming.end_signature(), encoding)
    }

    pub fn with_signatures(
        start_signature: impl Into<String>,
        end_signature: impl Into<String>,
        encoding: TextEncoding,
    ) -> Self {
        Self {
            start_signature: start_signature.into(),
            end_signature: end_signature.into(),
            encoding,
            kind: None,
            raw_kind: String::new(),
            columns: HashMap::new(),
            status: BagStatus::Open,
        }
    }

    pub fn status(&self) -> BagStatus {
        self.status
    }

    /// Kind of the record currently open, if a start sentinel was seen.
    pub fn kind(&self) -> Option<ChangeKind> {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.status == BagStatus::Closed
    }

    /// Feed one envelope. On error the bag has already discarded its record.
    pub fn add_message(
        &mut self,
        type_tag: &str,
        payload: Option<&[u8]>,
    ) -> Result<BagStatus, NotifierError> {
        let is_start = type_tag == self.start_signature;
        if self.status == BagStatus::Discarding && !is_start {
            tracing::trace!(tag = type_tag, "Skipping envelope of a discarded record");
            return Ok(BagStatus::Discarding);
        }

        let in_record = self.kind.is_some();
        let result = self.apply(type_tag, payload);
        if result.is_err() {
            self.reset();
            // Stray envelopes outside any record each get their own fault
            if in_record || is_start {
                self.status = BagStatus::Discarding;
            }
        }
        result
    }

    fn apply(&mut self, type_tag: &str, payload: Option<&[u8]>) -> Result<BagStatus, NotifierError> {
        if type_tag == self.start_signature {
            self.reset();
            let (kind, raw) = self.decode_kind(payload)?;
            self.kind = Some(kind);
            self.raw_kind = raw;
            return Ok(BagStatus::Open);
        }

        if type_tag == self.end_signature {
            let (end_kind, _) = self.decode_kind(payload)?;
            return match self.kind {
                Some(open) if open == end_kind && self.status != BagStatus::Closed => {
                    self.status = BagStatus::Closed;
                    Ok(BagStatus::Closed)
                }
                Some(_) if self.status == BagStatus::Closed => Err(NotifierError::BagAlreadyClosed {
                    tag: type_tag.to_string(),
                }),
                open => Err(NotifierError::DataMisaligned {
                    open: describe(open),
                    end: end_kind,
                }),
            };
        }

        if self.status == BagStatus::Closed {
            return Err(NotifierError::BagAlreadyClosed {
                tag: type_tag.to_string(),
            });
        }

        let tag = ColumnTag::parse(type_tag)?;
        let misaligned = || NotifierError::MessageMisaligned {
            tag: type_tag.to_string(),
            expected: describe(self.kind),
        };
        let token_kind = ChangeKind::parse_token(tag.kind_token).map_err(|_| misaligned())?;
        if Some(token_kind) != self.kind {
            return Err(misaligned());
        }

        self.columns
            .insert(tag.recipient.to_string(), payload.map(<[u8]>::to_vec));
        self.status = BagStatus::Collecting;
        Ok(BagStatus::Collecting)
    }

    /// Move the completed record out and reset the bag for the next cycle.
    pub fn take_closed(&mut self) -> Option<ClosedRecord> {
        if self.status != BagStatus::Closed {
            return None;
        }
        let record = ClosedRecord {
            kind: self.kind.unwrap_or(ChangeKind::None),
            raw_kind: std::mem::take(&mut self.raw_kind),
            columns: std::mem::take(&mut self.columns),
        };
        self.reset();
        Some(record)
    }

    /// Drop any partially assembled record.
    pub fn reset(&mut self) {
        self.kind = None;
        self.raw_kind.clear();
        self.columns.clear();
        self.status = BagStatus::Open;
    }

    fn decode_kind(&self, payload: Option<&[u8]>) -> Result<(ChangeKind, String), NotifierError> {
        let text = decode_text(payload.unwrap_or(&[]), self.encoding)
            .map_err(|err| NotifierError::UnknownChangeKind(err.to_string()))?;
        let kind = ChangeKind::parse_token(&text)?;
        Ok((kind, text.trim().to_string()))
    }
}

fn describe(kind: Option<ChangeKind>) -> String {
    kind.map(|k| k.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}
