//! palika Core - Shared Types
//!
//! Pure data structures shared by every other crate: collection and cache-key
//! identifiers, backend records, filters, badge counts, errors and
//! configuration. No I/O lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod filter;

pub use config::{CachePolicyConfig, CoalescePolicy, ReconnectConfig, RealtimeConfig};
pub use error::{
    ChannelError, ConfigError, FetchError, PalikaError, PalikaResult, StorageError,
    ValidationError,
};
pub use filter::{compare_values, Filter, FilterExpr, FilterOperator, OrderBy, QueryOptions, SortDirection};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Record identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

// ============================================================================
// COLLECTION NAME
// ============================================================================

/// Name of a logical record set on the backend, e.g. `community_issues`.
///
/// Immutable once built and used as a routing key, so construction is
/// validated: non-empty, lowercase ASCII letters, digits and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Validate and wrap a collection name.
    pub fn new(name: impl Into<String>) -> PalikaResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(PalikaError::Validation(ValidationError::RequiredFieldMissing {
                field: "collection".to_string(),
            }));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(PalikaError::Validation(ValidationError::InvalidValue {
                field: "collection".to_string(),
                reason: format!("'{}' contains invalid character '{}'", name, bad),
            }));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for CollectionName {
    type Err = PalikaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CollectionName {
    type Error = PalikaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(value: CollectionName) -> Self {
        value.0
    }
}

/// The collections the portal reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalCollection {
    News,
    Events,
    Notices,
    Businesses,
    CitizenCharter,
    Documents,
    WardRepresentatives,
    CommunityIssues,
    Donations,
    SupportRequests,
}

impl PortalCollection {
    pub const ALL: [PortalCollection; 10] = [
        Self::News,
        Self::Events,
        Self::Notices,
        Self::Businesses,
        Self::CitizenCharter,
        Self::Documents,
        Self::WardRepresentatives,
        Self::CommunityIssues,
        Self::Donations,
        Self::SupportRequests,
    ];

    /// Backend table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::News => "news",
            Self::Events => "events",
            Self::Notices => "notices",
            Self::Businesses => "businesses",
            Self::CitizenCharter => "citizen_charter",
            Self::Documents => "documents",
            Self::WardRepresentatives => "ward_representatives",
            Self::CommunityIssues => "community_issues",
            Self::Donations => "donations",
            Self::SupportRequests => "support_requests",
        }
    }

    pub fn name(&self) -> CollectionName {
        // Table names above are all valid identifiers.
        CollectionName(self.as_str().to_string())
    }
}

impl fmt::Display for PortalCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// Ordered tuple of strings identifying one cached query result.
///
/// Two keys are equal iff their parts are equal element-wise. A key names a
/// query, not a collection: one collection usually feeds several keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Key with a single part, e.g. `["news-list"]`.
    pub fn single(part: impl Into<String>) -> Self {
        Self(vec![part.into()])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Extend the key with one more part.
    pub fn child(&self, part: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One row of a backend collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntityId,
    pub fields: Map<String, Value>,
    pub created_at: Timestamp,
}

impl Record {
    /// Build a record with a fresh id. `fields` must be a JSON object.
    pub fn new(fields: Value) -> PalikaResult<Self> {
        match fields {
            Value::Object(fields) => Ok(Self {
                id: new_entity_id(),
                fields,
                created_at: Utc::now(),
            }),
            other => Err(PalikaError::Storage(StorageError::InvalidRecord {
                got: json_kind(&other).to_string(),
            })),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Overwrite the given fields, keeping the others.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        self.fields.extend(patch);
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// BADGE COUNTS
// ============================================================================

/// Outstanding-work counters shown on the operator view.
///
/// Each field comes from its own count query and is correct as of that
/// query's most recent notification. The fields are not a snapshot of one
/// instant. A field that has not loaded yet reads as `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BadgeCounts {
    pub issues: u64,
    pub donations: u64,
    pub support: u64,
}

impl BadgeCounts {
    pub fn total(&self) -> u64 {
        self.issues
            .saturating_add(self.donations)
            .saturating_add(self.support)
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
