//! Change feeds: one push subscription per topic.
//!
//! The provider pushes into an [`EventSink`]; the sync layer consumes the
//! resulting [`ChangeFeed`] as a plain stream of [`FeedSignal`]s:
//!
//! ```ignore
//! let mut client = ChangeFeedClient::open(push.as_ref(), Topic::room("42"), 256);
//!
//! for signal in client.feed_mut().ready() {
//!     match signal {
//!         FeedSignal::Event(event) => println!("seq {}", event.server_seq),
//!         FeedSignal::Connectivity(state) => println!("link {:?}", state),
//!         FeedSignal::Lagged(dropped) => println!("{} signals lost", dropped),
//!     }
//! }
//!
//! client.close();
//! ```

mod client;

pub use client::{ChangeFeed, ChangeFeedClient, Connectivity, EventSink, FeedSignal};
