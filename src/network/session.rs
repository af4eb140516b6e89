//! Viewer session registry
//!
//! Bookkeeping for connections on the broadcast channel: who is attached,
//! since when, and how many events each one received or missed by lagging.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One connected viewer on the broadcast channel.
#[derive(Debug, Clone)]
pub struct ViewerSession {
    /// Registry key
    pub id: Uuid,
    /// Remote address of the viewer
    pub peer: SocketAddr,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
    /// Events written to the socket
    pub events_sent: u64,
    /// Events dropped because the viewer fell behind
    pub events_skipped: u64,
}

impl ViewerSession {
    /// Fresh session for a just-accepted peer.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            events_sent: 0,
            events_skipped: 0,
        }
    }

    /// Time since the connection was accepted.
    pub fn connected_for(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }
}

/// Registry of open viewer connections.
#[derive(Clone, Default)]
pub struct ViewerSessions {
    sessions: Arc<RwLock<HashMap<Uuid, ViewerSession>>>,
}

impl ViewerSessions {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub async fn open(&self, peer: SocketAddr) -> ViewerSession {
        let session = ViewerSession::new(peer);
        self.sessions.write().await.insert(session.id, session.clone());
        session
    }

    /// Count one delivered event.
    pub async fn record_sent(&self, id: Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.events_sent += 1;
        }
    }

    /// Count events lost to lag.
    pub async fn record_skipped(&self, id: Uuid, skipped: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.events_skipped += skipped;
        }
    }

    /// Remove a connection, returning its final counters.
    pub async fn close(&self, id: Uuid) -> Option<ViewerSession> {
        self.sessions.write().await.remove(&id)
    }

    /// Snapshot of one session.
    pub async fn get(&self, id: Uuid) -> Option<ViewerSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no viewer is connected.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
