//! Event broadcaster
//!
//! Fans lifecycle events out to subscribed listeners over persistent
//! websocket connections. Subscriptions are topic- and order-scoped;
//! delivery is best-effort and at-most-once, with no queue or replay for
//! disconnected clients.

use crate::clock::now_ms;
use crate::events::{is_allowed_event, EventBus, SwapEvent, WireMessage};
use crate::timelock::Scheduler;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server ping cadence
const PING_INTERVAL_SECS: u64 = 15;
/// Connections silent for longer than this are reaped
const STALE_CONNECTION_MS: u64 = 30_000;

const LIVENESS_JOB: &str = "broadcast:liveness";

/// Inbound control messages on the connection protocol
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeEvents { events: Vec<String> },
    UnsubscribeEvents { events: Vec<String> },
    SubscribeOrder {
        #[serde(rename = "orderHash")]
        order_hash: String,
    },
    UnsubscribeOrder {
        #[serde(rename = "orderHash")]
        order_hash: String,
    },
    Ping,
}

/// One live connection's subscription state
struct Connection {
    subscribed_events: HashSet<String>,
    subscribed_orders: HashSet<String>,
    connected_at: u64,
    last_pong: u64,
    sender: mpsc::UnboundedSender<Message>,
}

pub struct EventBroadcaster {
    connections: DashMap<Uuid, Connection>,
    scheduler: Arc<Scheduler>,
    bus: EventBus,
    forwarder: DashMap<&'static str, tokio::task::JoinHandle<()>>,
}

impl EventBroadcaster {
    pub fn new(scheduler: Arc<Scheduler>, bus: EventBus) -> Self {
        Self {
            connections: DashMap::new(),
            scheduler,
            bus,
            forwarder: DashMap::new(),
        }
    }

    /// Start the bus forwarder and the liveness cadence
    pub fn start(self: &Arc<Self>) {
        let broadcaster = self.clone();
        let mut rx = self.bus.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        broadcaster.broadcast_event(&event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Broadcast forwarder lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarder.insert("bus-forwarder", handle);

        let broadcaster = self.clone();
        self.scheduler.spawn_recurring(
            LIVENESS_JOB,
            Duration::from_secs(PING_INTERVAL_SECS),
            move || {
                let broadcaster = broadcaster.clone();
                async move {
                    broadcaster.run_liveness_check(now_ms());
                }
            },
        );
    }

    /// Router exposing the websocket endpoint
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    fn register_connection(&self, sender: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        let now = now_ms();
        self.connections.insert(
            id,
            Connection {
                subscribed_events: HashSet::new(),
                subscribed_orders: HashSet::new(),
                connected_at: now,
                last_pong: now,
                sender,
            },
        );
        crate::metrics::record_ws_connections(self.connections.len());
        info!(connection = %id, "Listener connected");
        id
    }

    fn unregister_connection(&self, id: Uuid) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            crate::metrics::record_ws_connections(self.connections.len());
            info!(
                connection = %id,
                uptime_ms = now_ms().saturating_sub(conn.connected_at),
                "Listener disconnected"
            );
        }
    }

    fn record_pong(&self, id: Uuid) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.last_pong = now_ms();
        }
    }

    /// Apply an inbound control message to a connection's subscriptions
    fn handle_client_message(&self, id: Uuid, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(connection = %id, error = %e, "Unparseable control message");
                self.send_to(
                    id,
                    &WireMessage {
                        event: "error".to_string(),
                        data: json!({ "reason": "unparseable message" }),
                        timestamp: now_ms(),
                        order_hash: None,
                    },
                );
                return;
            }
        };

        match message {
            ClientMessage::SubscribeEvents { events } => {
                let (valid, invalid): (Vec<String>, Vec<String>) =
                    events.into_iter().partition(|e| is_allowed_event(e));

                if let Some(mut conn) = self.connections.get_mut(&id) {
                    conn.subscribed_events.extend(valid.iter().cloned());
                }
                self.send_to(
                    id,
                    &WireMessage {
                        event: "subscription_update".to_string(),
                        data: json!({ "subscribed": valid, "invalid": invalid }),
                        timestamp: now_ms(),
                        order_hash: None,
                    },
                );
            }
            ClientMessage::UnsubscribeEvents { events } => {
                let (valid, invalid): (Vec<String>, Vec<String>) =
                    events.into_iter().partition(|e| is_allowed_event(e));

                if let Some(mut conn) = self.connections.get_mut(&id) {
                    for event in &valid {
                        conn.subscribed_events.remove(event);
                    }
                }
                self.send_to(
                    id,
                    &WireMessage {
                        event: "subscription_update".to_string(),
                        data: json!({ "unsubscribed": valid, "invalid": invalid }),
                        timestamp: now_ms(),
                        order_hash: None,
                    },
                );
            }
            ClientMessage::SubscribeOrder { order_hash } => {
                if let Some(mut conn) = self.connections.get_mut(&id) {
                    conn.subscribed_orders.insert(order_hash);
                }
            }
            ClientMessage::UnsubscribeOrder { order_hash } => {
                if let Some(mut conn) = self.connections.get_mut(&id) {
                    conn.subscribed_orders.remove(&order_hash);
                }
            }
            ClientMessage::Ping => {
                self.record_pong(id);
                self.send_to(
                    id,
                    &WireMessage {
                        event: "pong".to_string(),
                        data: json!({}),
                        timestamp: now_ms(),
                        order_hash: None,
                    },
                );
            }
        }
    }

    /// Deliver an event to every connection subscribed by topic or by
    /// order. A connection matching both still receives it once.
    pub fn broadcast_event(&self, event: &SwapEvent) -> usize {
        let wire = event.to_wire();
        let text = match serde_json::to_string(&wire) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let name = event.name();
        let order_hash = event.order_hash();
        let mut delivered = 0;

        for conn in self.connections.iter() {
            let wants = conn.subscribed_events.contains(name)
                || conn.subscribed_orders.contains(order_hash);
            if wants && conn.sender.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
            }
        }

        crate::metrics::record_events_delivered(delivered);
        delivered
    }

    /// Ping open connections and reap the ones that stopped answering
    pub fn run_liveness_check(&self, now: u64) {
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|c| now.saturating_sub(c.last_pong) > STALE_CONNECTION_MS)
            .map(|c| *c.key())
            .collect();

        for id in stale {
            warn!(connection = %id, "Connection unresponsive, closing");
            if let Some(conn) = self.connections.get(&id) {
                let _ = conn.sender.send(Message::Close(None));
            }
            self.unregister_connection(id);
        }

        for conn in self.connections.iter() {
            let _ = conn.sender.send(Message::Ping(Vec::new()));
        }
    }

    fn send_to(&self, id: Uuid, message: &WireMessage) {
        if let Some(conn) = self.connections.get(&id) {
            if let Ok(text) = serde_json::to_string(message) {
                let _ = conn.sender.send(Message::Text(text));
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop background tasks and drop all connections
    pub fn stop(&self) {
        self.scheduler.cancel(LIVENESS_JOB);
        for entry in self.forwarder.iter() {
            entry.value().abort();
        }
        self.forwarder.clear();
        self.connections.clear();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<EventBroadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<EventBroadcaster>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = broadcaster.register_connection(tx);

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => broadcaster.handle_client_message(id, &text),
            Message::Pong(_) => broadcaster.record_pong(id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    broadcaster.unregister_connection(id);
    forward.abort();
}
