use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::transport::DeliveryHandle;

/// How long an unclaimed result stays parked before it is swept.
const PARKED_TTL: Duration = Duration::from_secs(30);

enum Slot {
    Waiting(oneshot::Sender<Result<(), String>>),
    Done(Result<(), String>),
}

/// Correlates transport ack/failure events with in-flight sends.
///
/// The registry's event pump resolves handles as events arrive; the
/// dispatcher waits on them. A result arriving before the waiter registers
/// is parked so the order of the two calls does not matter.
#[derive(Default)]
pub struct DeliveryTracker {
    slots: DashMap<DeliveryHandle, Slot>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the terminal result for a handle, waking its waiter if one is
    /// already registered. A result with no waiter is parked; handles are
    /// never reused, so an unclaimed park is swept after [`PARKED_TTL`].
    pub fn resolve(self: &Arc<Self>, handle: &str, result: Result<(), String>) {
        match self.slots.entry(handle.to_string()) {
            Entry::Occupied(occupied) => {
                // A second terminal event for the same handle keeps the
                // first parked outcome.
                if matches!(occupied.get(), Slot::Waiting(_)) {
                    if let Slot::Waiting(tx) = occupied.remove() {
                        let _ = tx.send(result);
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Done(result));
                let tracker = self.clone();
                let handle = handle.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(PARKED_TTL).await;
                    tracker
                        .slots
                        .remove_if(&handle, |_, slot| matches!(slot, Slot::Done(_)));
                });
            }
        }
    }

    /// Waits for the terminal result of `handle`, up to `wait_for`.
    ///
    /// The parked-result check and the waiter registration happen under one
    /// map entry, so a concurrent resolve either lands before (and is
    /// returned here) or after (and wakes the registered waiter); it can
    /// never fall between the two.
    pub async fn wait(&self, handle: &str, wait_for: Duration) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(handle.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Done(result) = occupied.insert(Slot::Waiting(tx)) {
                    occupied.remove();
                    return result;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Waiting(tx));
            }
        }
        match timeout(wait_for, rx).await {
            Ok(Ok(result)) => result,
            // Resolver dropped or timer fired; either way the send outcome is
            // unknown, which the dispatcher treats as transient.
            Ok(Err(_)) | Err(_) => {
                self.slots.remove(handle);
                Err(format!("no delivery ack within {}s", wait_for.as_secs()))
            }
        }
    }
}
