//! WebSocket connection manager.
//!
//! Tracks live sessions, their topic subscriptions and heartbeats. The
//! transport is an outbound mpsc channel drained by a per-socket writer
//! task, so no lock is ever held across a network send. A second connect
//! with the same `client_id` supersedes the first: the old transport gets a
//! normal closure before the new session is acknowledged, and subscriptions
//! never migrate.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ws::protocol::{ServerFrame, Topic, CLOSE_NORMAL};

/// Outbound transport messages consumed by the socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type Transport = mpsc::Sender<Outbound>;

/// Session lifecycle; no re-entry once Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Active,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Session {
    transport: Transport,
    user_id: Option<String>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    state: SessionState,
    heartbeat_task: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    client_subscriptions: HashMap<String, HashSet<String>>,
    topic_subscribers: HashMap<String, HashSet<String>>,
}

/// Snapshot of manager state for observability endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_subscriptions: usize,
    pub topics: usize,
}

pub struct ConnectionManager {
    inner: RwLock<Inner>,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    send_timeout: Duration,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionManager")
            .field("active_connections", &stats.active_connections)
            .field("topics", &stats.topics)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(heartbeat_interval: Duration, idle_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            heartbeat_interval,
            idle_timeout,
            send_timeout,
        }
    }

    /// Register a session. An existing session under the same id is closed
    /// with a normal closure first; its subscriptions are dropped.
    pub async fn connect(
        self: &Arc<Self>,
        client_id: &str,
        transport: Transport,
        user_id: Option<String>,
    ) {
        // Supersede any previous transport before acknowledging the new one.
        let superseded = {
            let mut inner = self.inner.write();
            inner.sessions.insert(
                client_id.to_string(),
                Session {
                    transport: transport.clone(),
                    user_id,
                    connected_at: Utc::now(),
                    last_heartbeat: Instant::now(),
                    state: SessionState::Handshake,
                    heartbeat_task: None,
                },
            )
        };
        if let Some(mut old) = superseded {
            old.state = SessionState::Closing;
            if let Some(task) = old.heartbeat_task.take() {
                task.abort();
            }
            let _ = old
                .transport
                .send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded by new connection".into(),
                })
                .await;
            self.drop_subscriptions(client_id);
            info!(client_id, "existing session superseded");
        }

        // Per-session heartbeat pump.
        let heartbeat_task = {
            let manager = Arc::downgrade(self);
            let client_id = client_id.to_string();
            let every = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; the ack must go out first.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(manager) = manager.upgrade() else { break };
                    let frame = ServerFrame::Heartbeat {
                        timestamp: Utc::now().to_rfc3339(),
                    };
                    if !manager.send(&client_id, &frame).await {
                        break;
                    }
                }
            })
        };

        {
            let mut inner = self.inner.write();
            if let Some(session) = inner.sessions.get_mut(client_id) {
                session.state = SessionState::Active;
                session.heartbeat_task = Some(heartbeat_task);
            } else {
                heartbeat_task.abort();
            }
        }

        let ack = ServerFrame::ConnectionAck {
            client_id: client_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.send(client_id, &ack).await;
        info!(client_id, "client connected");
    }

    /// Idempotent teardown: removes indexes, cancels the heartbeat task and
    /// closes the transport with a normal code.
    pub async fn disconnect(&self, client_id: &str) {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.remove(client_id);
            if session.is_some() {
                Self::remove_subscriptions(&mut inner, client_id);
            }
            session
        };
        let Some(mut session) = session else { return };

        session.state = SessionState::Closing;
        if let Some(task) = session.heartbeat_task.take() {
            task.abort();
        }
        let _ = session
            .transport
            .send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "server disconnect".into(),
            })
            .await;
        session.state = SessionState::Closed;
        info!(client_id, "client disconnected");
    }

    fn drop_subscriptions(&self, client_id: &str) {
        let mut inner = self.inner.write();
        Self::remove_subscriptions(&mut inner, client_id);
    }

    fn remove_subscriptions(inner: &mut Inner, client_id: &str) {
        if let Some(topics) = inner.client_subscriptions.remove(client_id) {
            for topic in topics {
                if let Some(subscribers) = inner.topic_subscribers.get_mut(&topic) {
                    subscribers.remove(client_id);
                    if subscribers.is_empty() {
                        inner.topic_subscribers.remove(&topic);
                    }
                }
            }
        }
    }

    /// Validate and register a subscription; acks on success.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        if Topic::parse(topic).is_none() {
            let frame = ServerFrame::Error {
                error_code: "invalid_topic".into(),
                error_message: format!("topic does not match the grammar: {topic}"),
            };
            self.send(client_id, &frame).await;
            return false;
        }

        {
            let mut inner = self.inner.write();
            if !inner.sessions.contains_key(client_id) {
                return false;
            }
            inner
                .client_subscriptions
                .entry(client_id.to_string())
                .or_default()
                .insert(topic.to_string());
            inner
                .topic_subscribers
                .entry(topic.to_string())
                .or_default()
                .insert(client_id.to_string());
        }

        let ack = ServerFrame::SubscribeAck {
            topic: topic.to_string(),
        };
        self.send(client_id, &ack).await;
        debug!(client_id, topic, "subscribed");
        true
    }

    pub async fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner
                .client_subscriptions
                .get_mut(client_id)
                .is_some_and(|topics| topics.remove(topic));
            if removed {
                if let Some(subscribers) = inner.topic_subscribers.get_mut(topic) {
                    subscribers.remove(client_id);
                    if subscribers.is_empty() {
                        inner.topic_subscribers.remove(topic);
                    }
                }
            }
            removed
        };

        if removed {
            let ack = ServerFrame::UnsubscribeAck {
                topic: topic.to_string(),
            };
            self.send(client_id, &ack).await;
            debug!(client_id, topic, "unsubscribed");
        }
        removed
    }

    /// Serialize and send one frame. Dead transports trigger cleanup.
    pub async fn send(&self, client_id: &str, frame: &ServerFrame) -> bool {
        let transport = {
            let inner = self.inner.read();
            inner.sessions.get(client_id).map(|s| s.transport.clone())
        };
        let Some(transport) = transport else {
            return false;
        };

        let payload = Outbound::Text(frame.to_json());
        match tokio::time::timeout(self.send_timeout, transport.send(payload)).await {
            Ok(Ok(())) => true,
            _ => {
                warn!(client_id, "transport dead, cleaning up session");
                self.disconnect(client_id).await;
                false
            }
        }
    }

    /// Fan a frame out to every subscriber of a topic concurrently.
    /// Returns the number of successful sends.
    pub async fn broadcast(&self, topic: &str, frame: &ServerFrame) -> usize {
        let subscribers: Vec<String> = {
            let inner = self.inner.read();
            inner
                .topic_subscribers
                .get(topic)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        if subscribers.is_empty() {
            return 0;
        }

        let sends = subscribers.iter().map(|client_id| self.send(client_id, frame));
        let results = futures_util::future::join_all(sends).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Refresh the heartbeat clock for any inbound client activity.
    pub fn touch(&self, client_id: &str) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.get_mut(client_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut topics: Vec<String> = inner
            .client_subscriptions
            .get(client_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.read();
        inner
            .topic_subscribers
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.read().sessions.contains_key(client_id)
    }

    pub fn state_of(&self, client_id: &str) -> Option<SessionState> {
        self.inner.read().sessions.get(client_id).map(|s| s.state)
    }

    pub fn connected_at_of(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .sessions
            .get(client_id)
            .map(|s| s.connected_at)
    }

    pub fn user_of(&self, client_id: &str) -> Option<String> {
        self.inner
            .read()
            .sessions
            .get(client_id)
            .and_then(|s| s.user_id.clone())
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read();
        ConnectionStats {
            active_connections: inner.sessions.len(),
            total_subscriptions: inner.client_subscriptions.values().map(|t| t.len()).sum(),
            topics: inner.topic_subscribers.len(),
        }
    }

    /// Sweep sessions whose last inbound activity is older than the idle
    /// timeout. Returns the ids that were cleaned up.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let idle: Vec<String> = {
            let inner = self.inner.read();
            inner
                .sessions
                .iter()
                .filter(|(_, s)| s.last_heartbeat.elapsed() > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for client_id in &idle {
            warn!(client_id, "heartbeat timeout, closing session");
            self.disconnect(client_id).await;
        }
        idle
    }

    /// Spawn the idle-session janitor.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.sweep_idle().await;
            }
        })
    }
}
