//! Read-model observers: callbacks and bounded channel watches.

use super::entry::{CacheEntry, CacheKey};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Unique identifier for an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Callback invoked with every new version of an entry.
pub type ObserverCallback = Box<dyn FnMut(&Arc<CacheEntry>) + Send>;

/// Events delivered to channel watches.
#[derive(Clone, Debug)]
pub enum ReadModelEvent {
    /// The entry changed; this is its new version.
    Updated { entry: Arc<CacheEntry> },
    /// The watch was dropped.
    Dropped { reason: DropReason },
}

/// Why a watch was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Handle to a channel watch.
pub struct EntryWatch {
    pub id: ObserverId,
    /// Channel to receive events.
    pub receiver: Receiver<ReadModelEvent>,
}

impl EntryWatch {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ReadModelEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ReadModelEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ReadModelEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain pending events and return the newest entry version, if any.
    pub fn latest(&self) -> Option<Arc<CacheEntry>> {
        let mut latest = None;
        while let Ok(event) = self.receiver.try_recv() {
            if let ReadModelEvent::Updated { entry } = event {
                latest = Some(entry);
            }
        }
        latest
    }
}

enum Sink {
    Callback(ObserverCallback),
    Channel(Sender<ReadModelEvent>),
}

struct Observer {
    id: ObserverId,
    sink: Sink,
}

impl Observer {
    /// Deliver a new version. Returns false if the observer must be dropped.
    fn deliver(&mut self, entry: &Arc<CacheEntry>) -> bool {
        match &mut self.sink {
            Sink::Callback(callback) => {
                callback(entry);
                true
            }
            Sink::Channel(sender) => match sender.try_send(ReadModelEvent::Updated {
                entry: Arc::clone(entry),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // Might fail too, that's ok.
                    let _ = sender.try_send(ReadModelEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

/// Observers grouped by the key they watch.
#[derive(Default)]
pub(crate) struct Observers {
    by_key: HashMap<CacheKey, Vec<Observer>>,
    next_id: u64,
}

impl Observers {
    fn next_id(&mut self) -> ObserverId {
        self.next_id += 1;
        ObserverId(self.next_id)
    }

    pub(crate) fn add_callback(&mut self, key: CacheKey, callback: ObserverCallback) -> ObserverId {
        let id = self.next_id();
        self.by_key.entry(key).or_default().push(Observer {
            id,
            sink: Sink::Callback(callback),
        });
        id
    }

    pub(crate) fn add_watch(&mut self, key: CacheKey, buffer_size: usize) -> EntryWatch {
        let id = self.next_id();
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.by_key.entry(key).or_default().push(Observer {
            id,
            sink: Sink::Channel(sender),
        });
        EntryWatch { id, receiver }
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let mut removed = false;
        self.by_key.retain(|_, observers| {
            if let Some(pos) = observers.iter().position(|o| o.id == id) {
                let observer = observers.remove(pos);
                if let Sink::Channel(sender) = observer.sink {
                    // Best effort.
                    let _ = sender.try_send(ReadModelEvent::Dropped {
                        reason: DropReason::Unsubscribed,
                    });
                }
                removed = true;
            }
            !observers.is_empty()
        });
        removed
    }

    pub(crate) fn publish(&mut self, key: &CacheKey, entry: &Arc<CacheEntry>) {
        let Some(observers) = self.by_key.get_mut(key) else {
            return;
        };
        observers.retain_mut(|observer| {
            let keep = observer.deliver(entry);
            if !keep {
                debug!(observer = observer.id.0, "Dropping read-model observer");
            }
            keep
        });
        if observers.is_empty() {
            self.by_key.remove(key);
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }
}
