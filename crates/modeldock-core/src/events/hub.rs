//! Subscriber registry and fan-out.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};

use super::{Channel, Envelope, Event};

pub type ConnectionId = u64;

#[derive(Default)]
struct ConnState {
    channels: HashSet<Channel>,
    /// Latest undelivered sample per periodic channel.
    latest: BTreeMap<Channel, Envelope>,
}

struct ConnSlot {
    state: Mutex<ConnState>,
    queue: mpsc::UnboundedSender<Envelope>,
    notify: Notify,
}

#[derive(Default)]
struct Shared {
    slots: Mutex<HashMap<ConnectionId, Arc<ConnSlot>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn slot(&self, id: ConnectionId) -> Option<Arc<ConnSlot>> {
        self.slots.lock().get(&id).cloned()
    }
}

/// Channel subscriptions for every live connection.
///
/// The hub only holds the sending half of each connection's queue. When a
/// [`Connection`] is dropped its slot is removed, so nothing is retained for
/// connections that are gone.
#[derive(Clone, Default)]
pub struct EventHub {
    shared: Arc<Shared>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with no subscriptions.
    pub fn connect(&self) -> Connection {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ConnSlot {
            state: Mutex::new(ConnState::default()),
            queue: tx,
            notify: Notify::new(),
        });
        self.shared.slots.lock().insert(id, Arc::clone(&slot));
        tracing::debug!(connection = id, "hub connection opened");
        Connection {
            id,
            slot,
            rx,
            hub: Arc::downgrade(&self.shared),
        }
    }

    /// Returns false for an unknown connection.
    pub fn subscribe(&self, connection: ConnectionId, channel: Channel) -> bool {
        self.update(connection, |state| {
            state.channels.insert(channel);
        })
    }

    pub fn unsubscribe(&self, connection: ConnectionId, channel: Channel) -> bool {
        self.update(connection, |state| {
            state.channels.remove(&channel);
            state.latest.remove(&channel);
        })
    }

    pub fn subscribe_all(&self, connection: ConnectionId) -> bool {
        self.update(connection, |state| state.channels.extend(Channel::ALL))
    }

    pub fn unsubscribe_all(&self, connection: ConnectionId) -> bool {
        self.update(connection, |state| {
            state.channels.clear();
            state.latest.clear();
        })
    }

    fn update(&self, connection: ConnectionId, f: impl FnOnce(&mut ConnState)) -> bool {
        match self.shared.slot(connection) {
            Some(slot) => {
                f(&mut slot.state.lock());
                true
            }
            None => false,
        }
    }

    /// Current subscriptions of a connection, sorted.
    pub fn subscriptions(&self, connection: ConnectionId) -> Vec<Channel> {
        let Some(slot) = self.shared.slot(connection) else {
            return Vec::new();
        };
        let state = slot.state.lock();
        let mut channels: Vec<Channel> = state.channels.iter().copied().collect();
        channels.sort();
        channels
    }

    pub fn connection_count(&self) -> usize {
        self.shared.slots.lock().len()
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.shared
            .slots
            .lock()
            .values()
            .filter(|s| s.state.lock().channels.contains(&channel))
            .count()
    }

    /// Deliver to every connection subscribed to the event's channel.
    /// Returns how many connections it reached.
    pub fn publish(&self, event: impl Into<Event>) -> usize {
        let envelope = Envelope::now(event);
        let channel = envelope.channel();
        let slots = self.shared.slots.lock();
        let mut delivered = 0;
        for slot in slots.values() {
            let mut state = slot.state.lock();
            if !state.channels.contains(&channel) {
                continue;
            }
            if channel.is_periodic() {
                state.latest.insert(channel, envelope.clone());
                drop(state);
                slot.notify.notify_one();
            } else {
                drop(state);
                if slot.queue.send(envelope.clone()).is_err() {
                    continue;
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// Disconnect everyone. Receivers see the end of their stream once drained.
    pub fn close_all(&self) {
        let slots: Vec<Arc<ConnSlot>> = self.shared.slots.lock().drain().map(|(_, s)| s).collect();
        for slot in &slots {
            slot.state.lock().channels.clear();
            slot.notify.notify_one();
        }
        tracing::debug!(connections = slots.len(), "hub closed");
    }
}

/// The receiving side of one subscriber.
pub struct Connection {
    id: ConnectionId,
    slot: Arc<ConnSlot>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    hub: Weak<Shared>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_subscribed(&self, channel: Channel) -> bool {
        self.slot.state.lock().channels.contains(&channel)
    }

    fn take_latest(&self) -> Option<Envelope> {
        self.slot.state.lock().latest.pop_first().map(|(_, env)| env)
    }

    fn is_registered(&self) -> bool {
        self.hub
            .upgrade()
            .map(|shared| shared.slots.lock().contains_key(&self.id))
            .unwrap_or(false)
    }

    /// Next envelope for this connection. `None` once the hub closed it.
    ///
    /// Events queued for a channel that was unsubscribed meanwhile are dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(env) = self.take_latest() {
                return Some(env);
            }
            if !self.is_registered() {
                return None;
            }
            tokio::select! {
                biased;
                next = self.rx.recv() => match next {
                    Some(env) if self.is_subscribed(env.channel()) => return Some(env),
                    Some(_) => continue,
                    None => return None,
                },
                _ = self.slot.notify.notified() => continue,
            }
        }
    }

    /// Non-blocking variant of [`Connection::recv`].
    pub fn try_recv(&mut self) -> Option<Envelope> {
        if let Some(env) = self.take_latest() {
            return Some(env);
        }
        while let Ok(env) = self.rx.try_recv() {
            if self.is_subscribed(env.channel()) {
                return Some(env);
            }
        }
        None
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shared) = self.hub.upgrade() {
            shared.slots.lock().remove(&self.id);
            tracing::debug!(connection = self.id, "hub connection closed");
        }
    }
}
