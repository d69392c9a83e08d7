//! # Broadcast Registry
//!
//! Tracks the live viewers and fans accepted events out to them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Snapshot, then send**: `broadcast` copies the matching subscribers out
//!     of the list while holding the lock and releases it before the first
//!     send. A slow peer can hold up its own delivery but never a concurrent
//!     `connect`, `disconnect` or `broadcast`.
//!
//! 2.  **Render once**: the payload is serialized to JSON a single time per
//!     `broadcast` and wrapped in one [`BroadcastFrame`]. Every sink receives a
//!     clone of the same `Arc`, text included.
//!
//! 3.  **Best-effort delivery**: a send that fails or exceeds the send
//!     timeout is a [`SendFailure`]. The subscriber is removed on the spot and
//!     nobody else notices: not the ingest caller, not the other viewers. There
//!     is no retry.
//!
//! Subscriber lifecycle: `Connecting -> Active` when [`BroadcastRegistry::connect`]
//! returns. Connecting a sink that is already active hands back its existing
//! id. `Active -> Disconnected` on [`BroadcastRegistry::disconnect`] or on
//! the first failed send. `Disconnected` is terminal; its id is never reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;

use crate::models::BroadcastPayload;

/// A send to one subscriber did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscriber send failed")]
pub struct SendFailure;

/// One payload together with its JSON rendering, shared by every sink a
/// broadcast reaches.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFrame {
    payload: BroadcastPayload,
    text: Arc<str>,
}

impl BroadcastFrame {
    /// Serializes `payload` once.
    pub fn encode(payload: BroadcastPayload) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(&payload)?;
        Ok(Self {
            payload,
            text: Arc::from(text),
        })
    }

    /// The structured payload, for sinks that filter or inspect it.
    pub fn payload(&self) -> &BroadcastPayload {
        &self.payload
    }

    /// The payload as a JSON document.
    pub fn text(&self) -> &Arc<str> {
        &self.text
    }
}

/// The transport half of one live viewer connection.
#[async_trait]
pub trait SubscriberSink: Send + Sync {
    /// Delivers one frame. Any transport problem is reported as a
    /// [`SendFailure`]; the registry does not distinguish causes.
    async fn send(&self, frame: Arc<BroadcastFrame>) -> Result<(), SendFailure>;

    /// Called once after the registry dropped this sink because of a failed
    /// send, so the connection can be torn down.
    fn evicted(&self) {}
}

/// Opaque handle returned by [`BroadcastRegistry::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    agent_filter: Option<String>,
    sink: Arc<dyn SubscriberSink>,
}

/// The set of live viewers and the fan-out over them.
pub struct BroadcastRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl fmt::Debug for BroadcastRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastRegistry")
            .field("subscribers", &self.len())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl BroadcastRegistry {
    /// Creates an empty registry. A send that has not finished after
    /// `send_timeout` counts as failed.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a viewer. With `agent_filter` set it only receives payloads
    /// for that agent; the filter is fixed for the life of the subscription.
    ///
    /// Idempotent per sink: connecting an `Arc` that is already registered
    /// returns the id it was given the first time and leaves its filter as is.
    pub fn connect(&self, sink: Arc<dyn SubscriberSink>, agent_filter: Option<String>) -> SubscriptionId {
        let mut subscribers = self.lock();
        if let Some(existing) = subscribers.iter().find(|s| Arc::ptr_eq(&s.sink, &sink)) {
            tracing::debug!(subscription = %existing.id, "viewer already connected");
            return existing.id;
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscribers.push(Subscriber {
            id,
            agent_filter: agent_filter.clone(),
            sink,
        });
        tracing::info!(
            subscription = %id,
            agent_filter = agent_filter.as_deref().unwrap_or("*"),
            active = subscribers.len(),
            "viewer connected"
        );
        id
    }

    /// Removes a viewer. Returns `false` if it was already gone, which is
    /// not an error.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::info!(subscription = %id, active = subscribers.len(), "viewer disconnected");
        }
        removed
    }

    /// Whether `id` is still registered.
    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.lock().iter().any(|s| s.id == id)
    }

    /// Number of registered viewers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no viewer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `payload` to every matching viewer.
    ///
    /// Sends run concurrently and outside the lock. Viewers whose send fails
    /// or times out are removed. Returns how many deliveries succeeded.
    pub async fn broadcast(&self, payload: impl Into<BroadcastPayload>) -> usize {
        let payload = payload.into();

        let targets: Vec<(SubscriptionId, Arc<dyn SubscriberSink>)> = {
            let subscribers = self.lock();
            subscribers
                .iter()
                .filter(|s| payload.matches(s.agent_filter.as_deref()))
                .map(|s| (s.id, Arc::clone(&s.sink)))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let frame = match BroadcastFrame::encode(payload) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                tracing::error!("could not encode broadcast payload: {}", e);
                return 0;
            }
        };

        let send_timeout = self.send_timeout;
        let sends = targets.into_iter().map(|(id, sink)| {
            let frame = Arc::clone(&frame);
            async move {
                let outcome = match tokio::time::timeout(send_timeout, sink.send(frame)).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(SendFailure),
                };
                (id, sink, outcome)
            }
        });

        let mut delivered = 0;
        for (id, sink, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => delivered += 1,
                Err(SendFailure) => {
                    tracing::debug!(subscription = %id, "send failed, dropping viewer");
                    if self.disconnect(id) {
                        sink.evicted();
                    }
                }
            }
        }
        delivered
    }
}
