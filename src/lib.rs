//! # livesync
//!
//! Realtime synchronization for chat rooms and per-user notification feeds.
//!
//! Server-pushed change events are merged into a locally cached view that
//! was loaded by query, so the view converges to server truth despite
//! reordered or replayed delivery, dropped connections and concurrent
//! local writes.
//!
//! ## Core Concepts
//!
//! - **Topics**: `room:<id>` carries messages, `user:<id>` notifications
//! - **Feeds**: one push subscription per topic, shared by refcount
//! - **Cache**: versioned query results, merged by per-topic sequence
//! - **Mutations**: applied optimistically, then confirmed or reverted
//!
//! The engine owns no transport, storage or auth; those are collaborator
//! traits supplied by the host.
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{Collaborators, SyncConfig, SyncEngine};
//!
//! let mut engine = SyncEngine::new(collaborators, SyncConfig::default());
//!
//! let chat = engine.chat_view("42")?;
//! let watch = engine.watch(chat, 64)?;
//!
//! engine.send_message("42", "hi")?;
//!
//! loop {
//!     engine.pump();
//!     if let Some(entry) = watch.latest() {
//!         println!("{} messages", entry.len());
//!     }
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod collab;
pub mod engine;
pub mod error;
pub mod feed;
pub mod mutations;
pub mod reconciler;
pub mod subscriptions;
pub mod types;
pub mod views;

// Re-exports
pub use cache::{
    ApplyOutcome, CacheEntry, CacheKey, CacheStore, CachedItem, DropReason, EntryStatus,
    EntryWatch, ItemOrigin, MergePolicy, ObserverCallback, ObserverId, OptimisticPatch,
    QueryParams, ReadModelEvent, SortOrder, UndoToken,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    FetchReply, IdentityCollaborator, PushCollaborator, QueryCollaborator, SessionContext,
    Snapshot, Unsubscribe, WriteAck, WriteCollaborator, WriteReply,
};
pub use engine::{Collaborators, PumpStats, SyncConfig, SyncEngine, ViewToken};
pub use error::{Result, SyncError, TransportError, WriteError};
pub use feed::{ChangeFeed, ChangeFeedClient, Connectivity, EventSink, FeedSignal};
pub use mutations::{
    Confirmation, MutationConfig, MutationIntent, MutationNotice, MutationState, NoticeHandle,
    OptimisticMutationQueue, PendingMutation,
};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use subscriptions::{AttachToken, SubscriptionConfig, SubscriptionManager, TopicSummary};
pub use types::*;
pub use views::{MessageView, NotificationFeedSummary, NotificationType, NotificationView};
