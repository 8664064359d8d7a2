//! Multi-subscriber event bus with ordered, push-based delivery.
//!
//! Each subscriber gets its own unbounded channel: delivery order per
//! subscriber is exactly emission order, and a slow subscriber buffers
//! instead of stalling the emitter. Dropping a subscription (or calling
//! `unsubscribe`) deregisters it; closed receivers are pruned on the next
//! emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::domain::ProgressEvent;

struct BusInner {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<ProgressEvent>)>>,
}

/// Publish side of the progress stream. Cheap to clone; clones share
/// subscribers.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(0),
                senders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new subscriber and return its receiving handle.
    pub fn subscribe(&self) -> ProgressSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.senders.lock().unwrap().push((id, tx));
        ProgressSubscription {
            id,
            bus: Arc::downgrade(&self.inner),
            receiver: rx,
        }
    }

    /// Deliver an event to every live subscriber, in registration order.
    ///
    /// Subscribers whose receiver has been dropped are pruned here.
    pub fn emit(&self, event: ProgressEvent) {
        let mut senders = self.inner.senders.lock().unwrap();
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.senders.lock().unwrap().len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving side of one subscription. Dropping it unsubscribes.
pub struct ProgressSubscription {
    id: u64,
    bus: Weak<BusInner>,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Receive the next event, or `None` once the bus is gone and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Explicitly deregister this subscription.
    pub fn unsubscribe(self) {
        // Drop impl does the deregistration.
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade()
            && let Ok(mut senders) = inner.senders.lock()
        {
            senders.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for ProgressSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSubscription").field("id", &self.id).finish()
    }
}
