use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::now_iso;
use crate::types::{EventEnvelopeIn, RealtimeEvent};

/// Sink for real-time notifications. Publishing never fails from the
/// caller's point of view and must not block on subscribers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: RealtimeEvent);
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

type Clients = HashMap<usize, mpsc::UnboundedSender<String>>;

#[derive(Default)]
struct HubInner {
    clients: Mutex<Clients>,
    next_client_id: AtomicUsize,
}

/// Websocket fan-out. Every connected client receives every event published
/// while it is registered, in publish order; nothing is buffered for clients
/// that connect later.
#[derive(Clone, Default)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    // The map is only touched by non-panicking inserts, removes and sends.
    fn clients(&self) -> MutexGuard<'_, Clients> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.clients().insert(client_id, tx);
        debug!(client_id, "realtime client registered");
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: usize) {
        if self.clients().remove(&client_id).is_some() {
            debug!(client_id, "realtime client removed");
        }
    }

    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Sends on unbounded channels only, so holding the lock never waits on
    /// a slow socket.
    fn broadcast(&self, payload: &str) {
        let mut clients = self.clients();
        clients.retain(|client_id, sender| {
            let alive = sender.send(payload.to_string()).is_ok();
            if !alive {
                debug!(client_id = *client_id, "dropped disconnected realtime client");
            }
            alive
        });
    }

    fn send_to(&self, client_id: usize, payload: String) {
        let sender = self.clients().get(&client_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(payload);
        }
    }

    pub async fn handle_socket(self, socket: WebSocket) {
        let (client_id, mut rx) = self.subscribe();
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = ws_receiver.next().await {
            let text = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Close(_) => break,
                _ => continue,
            };

            let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
                continue;
            };

            match envelope.event.as_str() {
                "ping" => {
                    if let Some(payload) = event_payload("pong", json!({ "now": now_iso() })) {
                        self.send_to(client_id, payload);
                    }
                }
                other => debug!(client_id, event = other, "ignoring client event"),
            }
        }

        self.unsubscribe(client_id);
        send_task.abort();
    }
}

impl EventPublisher for RealtimeHub {
    fn publish(&self, event: RealtimeEvent) {
        let name = event.kind.event_name();
        let Some(payload) = event_payload(name, &event) else {
            warn!(event = name, "failed to serialize realtime event");
            return;
        };
        self.broadcast(&payload);
    }
}
