//! Change notifications.

use chrono::Utc;
use palika_core::{CollectionName, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation reported by the backend, when it says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The backend did not say, or notifications were dropped and this one
    /// stands in for all of them.
    Unknown,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A payload-less signal that some row in `collection` changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub kind: ChangeKind,
    /// Row that changed, if the backend reports it.
    pub record_id: Option<EntityId>,
    pub received_at: Timestamp,
}

impl ChangeEvent {
    pub fn new(collection: CollectionName, kind: ChangeKind) -> Self {
        Self {
            collection,
            kind,
            record_id: None,
            received_at: Utc::now(),
        }
    }

    /// Notification with no detail at all.
    pub fn opaque(collection: CollectionName) -> Self {
        Self::new(collection, ChangeKind::Unknown)
    }

    pub fn with_record(mut self, record_id: EntityId) -> Self {
        self.record_id = Some(record_id);
        self
    }
}
