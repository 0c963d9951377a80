//! Topic subscriptions shared by refcount.
//!
//! Any number of consumers may attach to the same topic; exactly one
//! change feed is open for it. The feed outlives its last consumer by a
//! short grace period so a view that unmounts and remounts does not
//! thrash the push connection.
//!
//! # Example
//!
//! ```ignore
//! let mut manager = SubscriptionManager::new(push, SubscriptionConfig::default());
//!
//! let a = manager.attach(Topic::room("42"));
//! let b = manager.attach(Topic::room("42")); // same feed
//!
//! manager.detach(a, Instant::now());
//! manager.detach(b, Instant::now()); // closes after the grace period
//!
//! for topic in manager.expire(Instant::now() + Duration::from_secs(3)) {
//!     println!("closed {}", topic);
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{AttachToken, SubscriptionConfig, TopicSummary};
