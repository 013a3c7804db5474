//! Realtime metrics feed
//!
//! Observers are WebSocket connections. The registry only holds weak
//! references to them; each connection task owns its observer, so a closed
//! socket disappears from the registry on the next publish without any
//! explicit unregister step.
//!
//! A snapshot is published on a fixed interval and whenever a request
//! completes. Delivery to each observer is a non-blocking `try_send`, so one
//! slow or dead observer never delays the others.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BroadcastConfig;
use crate::metrics::MetricsAggregator;

const GREETING: &str = r#"{"message":"Connected to proxy metrics stream."}"#;

/// A registered feed consumer.
pub struct Observer {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

impl Observer {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

pub struct Broadcaster {
    observers: DashMap<Uuid, Weak<Observer>>,
    metrics: Arc<MetricsAggregator>,
    config: BroadcastConfig,
}

impl Broadcaster {
    pub fn new(metrics: Arc<MetricsAggregator>, config: BroadcastConfig) -> Self {
        Self {
            observers: DashMap::new(),
            metrics,
            config,
        }
    }

    /// Register a new observer. The caller keeps the returned `Arc`; dropping
    /// it unregisters the observer.
    pub fn register(&self) -> (Arc<Observer>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.observer_buffer.max(1));
        let observer = Arc::new(Observer {
            id: Uuid::new_v4(),
            tx,
        });
        self.observers.insert(observer.id, Arc::downgrade(&observer));
        debug!(observer = %observer.id, "Registered metrics observer");
        (observer, rx)
    }

    /// Observers whose connection is still alive.
    pub fn observer_count(&self) -> usize {
        self.observers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Send one snapshot to every observer; returns how many accepted it.
    pub async fn publish(&self) -> usize {
        if self.observers.is_empty() {
            return 0;
        }

        let snapshot = self.metrics.snapshot().await;
        let payload = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize metrics snapshot");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.observers.iter() {
            let Some(observer) = entry.value().upgrade() else {
                dead.push(*entry.key());
                continue;
            };
            match observer.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(observer = %observer.id, "Observer is lagging, dropping snapshot");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(observer.id),
            }
        }

        for id in dead {
            self.observers.remove(&id);
            debug!(observer = %id, "Removed closed metrics observer");
        }

        delivered
    }

    /// Publish on every tick and after every completed request until
    /// `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.config.interval_ms,
            "Metrics broadcaster started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.metrics.changed() => {}
                _ = shutdown.changed() => break,
            }
            self.publish().await;
        }

        info!("Metrics broadcaster stopped");
    }

    /// Drive one WebSocket connection until the client goes away.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (observer, mut rx) = self.register();
        let (mut ws_write, mut ws_read) = socket.split();

        info!(observer = %observer.id(), "Metrics stream connected");

        if ws_write.send(Message::Text(GREETING.into())).await.is_err() {
            return;
        }
        match serde_json::to_string(&self.metrics.snapshot().await) {
            Ok(json) => {
                if ws_write.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize metrics snapshot"),
        }

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(json) = outgoing else { break };
                    if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                        debug!(observer = %observer.id(), error = %e, "Metrics stream write failed");
                        break;
                    }
                }
                incoming = ws_read.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(observer = %observer.id(), error = %e, "Metrics stream read failed");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        info!(observer = %observer.id(), "Metrics stream disconnected");
    }
}
