//! Viewer WebSocket sessions.
//!
//! The server only pushes. Inbound frames are read solely to notice the
//! viewer going away; a viewer evicted by the registry is closed from here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use lib_common::core::{BroadcastFrame, SendFailure, SubscriberSink};

use super::state::AppState;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The write half of a viewer socket, registered with the broadcast registry.
pub struct WsSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: CancellationToken,
}

impl WsSink {
    fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
            closed: CancellationToken::new(),
        }
    }

    async fn close(&self) {
        let mut sender = self.sender.lock().await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sender.close()).await;
    }
}

#[async_trait]
impl SubscriberSink for WsSink {
    async fn send(&self, frame: Arc<BroadcastFrame>) -> Result<(), SendFailure> {
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(frame.text().as_ref().into()))
            .await
            .map_err(|_| SendFailure)
    }

    fn evicted(&self) {
        self.closed.cancel();
    }
}

pub async fn handle_socket(socket: WebSocket, state: AppState, agent_filter: Option<String>) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink::new(sender));
    let id = state.registry.connect(sink.clone(), agent_filter);

    loop {
        tokio::select! {
            _ = sink.closed.cancelled() => {
                tracing::info!(subscription = %id, "viewer evicted");
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.disconnect(id);
    sink.close().await;
    tracing::info!(subscription = %id, "viewer disconnected");
}
