//! palika Events - Change Feed Contract
//!
//! This crate defines the contract the realtime core expects from the hosted
//! backend, without providing an implementation. The backend offers two
//! things:
//!
//! - request/response reads: filtered point queries and aggregate counts
//!   over named collections;
//! - a subscription primitive: once a channel is opened for a collection, a
//!   [`ChangeEvent`] is emitted for every insert, update or delete affecting
//!   it.
//!
//! ```text
//! backend mutation ──→ ChangeEvent ──→ ChangeStream ──→ listener
//!                                                          │
//!                                             invalidate cache keys
//! ```
//!
//! A notification means only "something changed". Consumers must not rely
//! on [`ChangeEvent::kind`] or [`ChangeEvent::record_id`]: backends are free
//! to leave them unset, and the realtime core ignores them.

mod event;
mod feed;

pub use event::{ChangeEvent, ChangeKind};
pub use feed::{ChangeFeed, ChangeStream, ChannelHandle};

// Re-export core types for convenience
pub use palika_core::{CollectionName, Filter, PalikaResult, QueryOptions, Record};
