//! Telemetry fan-out
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! subscriber's queue is full its oldest unread snapshot is dropped, so a slow
//! consumer may miss intermediate states but always catches up to the latest.
//! Subscribing does not replay history.

use crate::codec::RobotState;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Why a telemetry stream ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("session shut down")]
    Shutdown,
    #[error("session terminated: {0}")]
    Terminated(String),
}

struct QueueState {
    items: VecDeque<RobotState>,
    dropped: u64,
    closed: Option<CloseReason>,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, snapshot: RobotState) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
            }
            state.items.push_back(snapshot);
        }
        self.notify.notify_one();
    }

    fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }
}

struct HubInner {
    subscribers: Mutex<Vec<(u64, Arc<SubscriberQueue>)>>,
    closed: Mutex<Option<CloseReason>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Publisher side of the telemetry stream
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl TelemetryHub {
    /// Create a hub whose subscribers buffer at most `capacity` snapshots each
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Receive every snapshot published from now on
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(self.inner.capacity),
                dropped: 0,
                closed: None,
            }),
            notify: Notify::new(),
            capacity: self.inner.capacity,
        });

        // Hold the closed flag while registering so a concurrent close cannot slip between
        let closed = self.inner.closed.lock();
        match closed.as_ref() {
            Some(reason) => queue.close(reason.clone()),
            None => self.inner.subscribers.lock().push((id, Arc::clone(&queue))),
        }
        drop(closed);

        debug!("Telemetry subscriber {} registered", id);
        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Hand a snapshot to every subscriber; returns how many received it
    pub fn publish(&self, snapshot: &RobotState) -> usize {
        let subscribers = self.inner.subscribers.lock();
        for (_, queue) in subscribers.iter() {
            queue.push(snapshot.clone());
        }
        subscribers.len()
    }

    /// End every subscription; subscribers drain what is buffered first
    pub fn close(&self, reason: CloseReason) {
        let mut closed = self.inner.closed.lock();
        if closed.is_some() {
            return;
        }
        *closed = Some(reason.clone());
        let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
        for (_, queue) in subscribers {
            queue.close(reason.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().is_some()
    }
}

/// Consumer side of the telemetry stream; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Wait for the next snapshot
    ///
    /// Buffered snapshots are always delivered before the close reason.
    pub async fn recv(&mut self) -> Result<RobotState, CloseReason> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut state = self.queue.state.lock();
                if let Some(snapshot) = state.items.pop_front() {
                    return Ok(snapshot);
                }
                if let Some(reason) = &state.closed {
                    return Err(reason.clone());
                }
            }
            notified.await;
        }
    }

    /// Take a buffered snapshot without waiting
    pub fn try_recv(&mut self) -> Option<RobotState> {
        self.queue.state.lock().items.pop_front()
    }

    /// Snapshots discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    pub fn pending(&self) -> usize {
        self.queue.state.lock().items.len()
    }

    /// Turn the subscription into a stream that ends when the session closes
    pub fn into_stream(self) -> impl Stream<Item = RobotState> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            let snapshot = subscription.recv().await.ok()?;
            Some((snapshot, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().retain(|(id, _)| *id != self.id);
            debug!("Telemetry subscriber {} released", self.id);
        }
    }
}
