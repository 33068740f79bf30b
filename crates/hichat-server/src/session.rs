use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use hichat_core::{ConnectionId, GroupId, UserId};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::relay::RelaySender;

/// Result of a non-blocking push into a session's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue is at capacity; the payload was dropped.
    Full,
    /// The connection's writer is gone.
    Closed,
}

/// One live connection bound to a user.
#[derive(Debug)]
pub struct Session {
    user_id: UserId,
    connection_id: ConnectionId,
    tx: mpsc::Sender<String>,
    groups: HashSet<GroupId>,
}

impl Session {
    pub fn new(user_id: UserId, tx: mpsc::Sender<String>, groups: HashSet<GroupId>) -> Self {
        Self {
            user_id,
            connection_id: ConnectionId::new(),
            tx,
            groups,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Groups the user belonged to when the connection was accepted.
    pub fn groups(&self) -> &HashSet<GroupId> {
        &self.groups
    }

    /// Queue a payload for the writer without waiting. A full queue drops
    /// the payload so one slow reader cannot stall the dispatcher.
    pub fn push(&self, payload: String) -> PushOutcome {
        match self.tx.try_send(payload) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    connection_id = %self.connection_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                PushOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}

/// Process-wide map from user to its current session.
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
    queue_capacity: usize,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_capacity,
        }
    }

    /// Create a session with a fresh outbound queue and register it.
    pub fn connect(
        &self,
        user_id: UserId,
        groups: HashSet<GroupId>,
    ) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(Session::new(user_id, tx, groups));
        if let Some(previous) = self.register(Arc::clone(&session)) {
            tracing::info!(
                user_id = %user_id,
                replaced = %previous.connection_id(),
                "Replaced existing session"
            );
        }
        (session, rx)
    }

    /// Insert or replace the session for its user. Returns the replaced one.
    /// The old session keeps running but is no longer reachable by lookup.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.user_id(), session)
    }

    /// Current session for a user. The map guard is released before returning.
    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&user_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the user's entry if it still belongs to `connection_id`.
    pub fn unregister(&self, user_id: UserId, connection_id: &ConnectionId) -> bool {
        self.sessions
            .remove_if(&user_id, |_, session| session.connection_id() == connection_id)
            .is_some()
    }

    /// Number of reachable users.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Removes the registry entry when the connection handler exits, however it exits.
struct Registration {
    registry: Arc<SessionRegistry>,
    user_id: UserId,
    connection_id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.unregister(self.user_id, &self.connection_id) {
            tracing::info!(
                user_id = %self.user_id,
                connection_id = %self.connection_id,
                "Session unregistered"
            );
        }
    }
}

/// Run one WebSocket connection: a writer draining the session queue, a
/// reader feeding the relay. Returns when either side stops.
pub async fn handle_ws_connection(
    socket: WebSocket,
    session: Arc<Session>,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SessionRegistry>,
    relay: RelaySender,
    heartbeat: Duration,
) {
    let user_id = session.user_id();
    let _registration = Registration {
        registry,
        user_id,
        connection_id: session.connection_id().clone(),
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued payloads to the socket + periodic ping
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        tracing::info!(user_id = %user_id, error = %e, "WebSocket write failed");
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(user_id = %user_id, "Sent ping");
                }
            }
        }
    }.in_current_span());

    // Reader task: hand every inbound frame to the relay
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let payload = match frame {
                Ok(WsMessage::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(WsMessage::Binary(data)) => data,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::info!(user_id = %user_id, error = %e, "WebSocket read failed");
                    break;
                }
            };
            if let Err(e) = relay.send(payload).await {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    kind = e.error_kind(),
                    "Relay rejected message"
                );
                if e.is_fatal() {
                    break;
                }
            }
        }
    }.in_current_span());

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    tracing::info!(user_id = %user_id, "WebSocket client disconnected");
}
