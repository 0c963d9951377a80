//! Optimistic mutations.
//!
//! A submitted [`MutationIntent`] is shown at once in every live view of
//! its topic, then settled by whichever authoritative signal arrives first:
//! - the matching change event (the provisional row is replaced)
//! - a snapshot that already contains the row
//! - the write acknowledgement, when the row is already cached
//! - the confirm timeout after an acknowledgement (the row is kept)
//!
//! A rejected or unacknowledged write reverts exactly the edits it made.

mod queue;
mod types;

pub use queue::OptimisticMutationQueue;
pub use types::{
    Confirmation, MutationConfig, MutationIntent, MutationNotice, MutationState, NoticeHandle,
    PendingMutation, MAX_MESSAGE_CHARS,
};
