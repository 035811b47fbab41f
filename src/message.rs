//! Queue item types and the rules for converting between them.
//!
//! Every HL7 message enters the system as a [`PendingEntry`]. Processing turns it into
//! exactly one of:
//!
//! 1. an [`ArchivedMessage`] when the message transform succeeds, or
//! 2. an [`ErrorRecord`] when it fails.
//!
//! The three shapes share an [`Envelope`] (identity, source and correlation key) and
//! differ only in the fields that exist for each outcome, which is why they are plain
//! structs tied together by the [`QueueItem`] sum type rather than a hierarchy.
//!
//! Archived messages older than the retention cutoff later have their payload moved to
//! filesystem storage; such rows keep only an index entry until they are hydrated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::error::Error;

/// Largest accepted `error_detail`, in bytes.
pub const MAX_ERROR_DETAIL_LEN: usize = 16_777_215;

/// Processing state of a queue item.
///
/// Pending entries go `Pending` -> `Processing` and are then removed. Archived messages
/// are `Processed` and become `Migrated` once their payload lives on the filesystem.
/// `Deleted` only appears on rows carried over from older data and is never produced.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MessageState {
    Pending = 0,
    Processing = 1,
    Processed = 2,
    Deleted = 4,
    Migrated = 5,
}

/// A named origin system for messages.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub retired: bool,
    pub retire_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Fields shared by every queue item.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Stable external identifier
    pub uuid: Uuid,
    /// Lookup key of the [`Source`] the message came from
    pub source_id: i64,
    /// Caller-supplied correlation key, not necessarily unique
    pub source_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(source_id: i64, source_key: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source_id,
            source_key,
            created_at: Utc::now(),
        }
    }

    /// Envelope for a record derived from this one: same origin, new identity and
    /// creation time.
    fn derive(&self) -> Self {
        Self::new(self.source_id, self.source_key.clone())
    }
}

/// A message waiting in the inbound queue.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct PendingEntry {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub envelope: Envelope,
    pub payload: String,
    pub message_state: MessageState,
    pub last_error_message: Option<String>,
}

impl PendingEntry {
    pub fn new(source_id: i64, source_key: Option<String>, payload: impl Into<String>) -> Self {
        Self {
            envelope: Envelope::new(source_id, source_key),
            payload: payload.into(),
            message_state: MessageState::Pending,
            last_error_message: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.envelope.uuid
    }

    pub fn to_archive(&self) -> ArchivedMessage {
        ArchivedMessage::new(self.envelope.derive(), self.payload.clone())
    }

    /// Error record for this entry with an empty summary and detail.
    pub fn to_error(&self) -> ErrorRecord {
        ErrorRecord {
            envelope: self.envelope.derive(),
            payload: self.payload.clone(),
            error_summary: String::new(),
            error_detail: String::new(),
        }
    }
}

/// A successfully processed message.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub envelope: Envelope,
    payload: Option<String>,
    pub message_state: MessageState,
    loaded: bool,
    pub migrated_at: Option<DateTime<Utc>>,
}

impl ArchivedMessage {
    pub fn new(envelope: Envelope, payload: String) -> Self {
        Self {
            envelope,
            payload: Some(payload),
            message_state: MessageState::Processed,
            loaded: true,
            migrated_at: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.envelope.uuid
    }

    /// The message text, or `None` while the payload lives on the filesystem and the
    /// message has not been hydrated.
    pub fn payload(&self) -> Option<&str> {
        if self.loaded {
            self.payload.as_deref()
        } else {
            None
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn hydrate(&mut self, payload: String) {
        self.payload = Some(payload);
        self.loaded = true;
    }

    /// Marks the payload as moved out of the primary store.
    pub(crate) fn unload(&mut self, at: DateTime<Utc>) {
        self.payload = None;
        self.loaded = false;
        self.message_state = MessageState::Migrated;
        self.migrated_at = Some(at);
    }

    /// Overrides the creation time, e.g. when importing archives from older data.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.envelope.created_at = created_at;
        self
    }
}

/// A message whose processing failed.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub envelope: Envelope,
    pub payload: String,
    pub error_summary: String,
    error_detail: String,
}

impl ErrorRecord {
    pub fn uuid(&self) -> Uuid {
        self.envelope.uuid
    }

    pub fn error_detail(&self) -> &str {
        &self.error_detail
    }

    /// Sets the free-text detail. Values longer than [`MAX_ERROR_DETAIL_LEN`] bytes are
    /// rejected, never truncated.
    pub fn set_error_detail(&mut self, detail: impl Into<String>) -> Result<(), Error> {
        let detail = detail.into();
        check_error_detail(&detail)?;
        self.error_detail = detail;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        check_error_detail(&self.error_detail)
    }

    /// Pending entry that puts this message back in the queue.
    pub fn to_pending(&self) -> PendingEntry {
        PendingEntry {
            envelope: self.envelope.derive(),
            payload: self.payload.clone(),
            message_state: MessageState::Pending,
            last_error_message: Some(self.error_summary.clone()),
        }
    }
}

fn check_error_detail(detail: &str) -> Result<(), Error> {
    if detail.len() > MAX_ERROR_DETAIL_LEN {
        return Err(Error::validation(format!(
            "error detail is {} bytes, the limit is {MAX_ERROR_DETAIL_LEN}",
            detail.len()
        )));
    }
    Ok(())
}

/// Any of the three queue item shapes.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueItem {
    Pending(PendingEntry),
    Archived(ArchivedMessage),
    Error(ErrorRecord),
}

impl QueueItem {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Pending(item) => &item.envelope,
            Self::Archived(item) => &item.envelope,
            Self::Error(item) => &item.envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingEntry {
        PendingEntry::new(7, Some("visit-42".to_owned()), "MSH|^~\\&|FORMENTRY")
    }

    #[test]
    fn test_to_archive_copies_origin() {
        let entry = pending();
        let archive = entry.to_archive();

        assert_eq!(archive.envelope.source_id, entry.envelope.source_id);
        assert_eq!(archive.envelope.source_key, entry.envelope.source_key);
        assert_eq!(archive.payload(), Some(entry.payload.as_str()));
        assert_eq!(archive.message_state, MessageState::Processed);
        assert!(archive.is_loaded());
        assert_ne!(archive.uuid(), entry.uuid());
        assert!(archive.envelope.created_at >= entry.envelope.created_at);
    }

    #[test]
    fn test_to_error_copies_origin() {
        let entry = pending();
        let error = entry.to_error();

        assert_eq!(error.envelope.source_id, entry.envelope.source_id);
        assert_eq!(error.envelope.source_key, entry.envelope.source_key);
        assert_eq!(error.payload, entry.payload);
        assert_ne!(error.uuid(), entry.uuid());
        assert!(error.error_detail().is_empty());
    }

    #[test]
    fn test_unloaded_archive_hides_payload() {
        let mut archive = pending().to_archive();
        archive.unload(Utc::now());

        assert_eq!(archive.payload(), None);
        assert_eq!(archive.message_state, MessageState::Migrated);

        archive.hydrate("MSH|restored".to_owned());
        assert_eq!(archive.payload(), Some("MSH|restored"));
    }

    #[test]
    fn test_error_detail_bound() {
        let mut error = pending().to_error();

        error
            .set_error_detail("x".repeat(MAX_ERROR_DETAIL_LEN))
            .unwrap();
        assert_eq!(error.error_detail().len(), MAX_ERROR_DETAIL_LEN);

        let res = error.set_error_detail("x".repeat(MAX_ERROR_DETAIL_LEN + 1));
        assert!(matches!(res, Err(Error::Validation { .. })));
        // rejected values leave the previous detail in place
        assert_eq!(error.error_detail().len(), MAX_ERROR_DETAIL_LEN);
    }

    #[test]
    fn test_queue_item_json_shape() {
        let entry = pending();
        let json = serde_json::to_value(QueueItem::Pending(entry.clone())).unwrap();

        assert_eq!(json["kind"], "pending");
        assert_eq!(json["message_state"], "pending");
        assert_eq!(json["source_key"], "visit-42");
        assert_eq!(json["uuid"], entry.uuid().to_string());
    }

    #[test]
    fn test_message_state_names() {
        assert_eq!(MessageState::Processing.to_string(), "processing");
        assert_eq!("MIGRATED".parse::<MessageState>().unwrap(), MessageState::Migrated);
        assert!("archived".parse::<MessageState>().is_err());
    }
}
