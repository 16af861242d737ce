//! Error types for palika operations

use crate::{CacheKey, CollectionName, EntityId};
use thiserror::Error;

/// Change-feed channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to open channel for {collection} after {attempts} attempt(s): {reason}")]
    OpenFailed {
        collection: CollectionName,
        attempts: u32,
        reason: String,
    },

    #[error("Channel for {collection} closed by the backend")]
    Closed { collection: CollectionName },

    #[error("Unknown channel handle {handle_id}")]
    UnknownHandle { handle_id: u64 },
}

/// Query and count errors raised while computing a cached value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Query for {key} failed: {reason}")]
    QueryFailed { key: CacheKey, reason: String },

    #[error("No fetcher registered for {key}")]
    NoFetcher { key: CacheKey },

    #[error("Cached value for {key} is not a {expected}")]
    TypeMismatch { key: CacheKey, expected: String },
}

/// Backend storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found in {collection} with id {id}")]
    NotFound {
        collection: CollectionName,
        id: EntityId,
    },

    #[error("Collection {collection} unavailable: {reason}")]
    CollectionUnavailable {
        collection: CollectionName,
        reason: String,
    },

    #[error("Record fields must be a JSON object, got {got}")]
    InvalidRecord { got: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all palika errors.
#[derive(Debug, Clone, Error)]
pub enum PalikaError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for palika operations.
pub type PalikaResult<T> = Result<T, PalikaError>;

// =============================================================================
// TESTS
// =============================================================================
