//! Versioned in-memory cache of query results.
//!
//! Each [`CacheKey`] names one query (kind + filter/order/window); its
//! [`CacheEntry`] holds the merged result. Entries change only through
//! [`CacheStore`]:
//! - full snapshot replace after a query
//! - seq-gated merge of pushed change events
//! - reversible optimistic patches
//!
//! # Example
//!
//! ```ignore
//! let mut store = CacheStore::new();
//! let key = CacheKey::room_messages("42");
//!
//! store.begin_load(&key);
//! store.replace(&key, snapshot.items, snapshot.seq, Timestamp::now());
//!
//! let watch = store.watch(&key, 64);
//! store.apply_change(&key, &event, Timestamp::now());
//!
//! if let Some(entry) = watch.latest() {
//!     println!("{} messages", entry.len());
//! }
//! ```

mod entry;
mod observers;
mod store;

pub use entry::{
    ApplyOutcome, CacheEntry, CacheKey, CachedItem, EntryStatus, ItemOrigin, MergePolicy,
    QueryParams, RetryStats, SortOrder,
};
pub use observers::{DropReason, EntryWatch, ObserverCallback, ObserverId, ReadModelEvent};
pub use store::{CacheStore, OptimisticPatch, UndoToken};
