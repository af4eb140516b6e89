//! Broadcast channel: one publisher, any number of viewers.
//!
//! Events are encoded once by [`Broadcaster::publish`] and fanned out through
//! a `tokio::sync::broadcast` channel. Each accepted viewer gets its own task
//! and its own receiver; a viewer that fails a write, closes its socket or
//! falls too far behind is dropped without affecting the others.

use crate::acquisition::Interrupt;
use crate::error::SyncResult;
use crate::network::protocol::{encode_message, write_frame, Event};
use crate::network::session::ViewerSessions;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// Default number of encoded events a slow viewer may lag behind.
pub const DEFAULT_BACKLOG: usize = 256;

/// Cloneable publishing handle.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Bytes>,
    sessions: ViewerSessions,
}

impl Broadcaster {
    /// Create a broadcaster whose viewers may lag `backlog` events.
    pub fn new(backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        Self {
            tx,
            sessions: ViewerSessions::new(),
        }
    }

    /// Push an event to every connected viewer.
    ///
    /// Returns the number of viewers it was queued for; zero when nobody is
    /// listening, which is not an error.
    pub fn publish(&self, event: &Event) -> usize {
        let frame = match encode_message(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode broadcast event: {}", e);
                return 0;
            }
        };
        self.tx.send(frame).unwrap_or(0)
    }

    /// Number of connected viewers.
    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Registry of connected viewers.
    pub fn sessions(&self) -> &ViewerSessions {
        &self.sessions
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

/// Accepts viewer connections and feeds them from a [`Broadcaster`].
pub struct BroadcastServer {
    listener: TcpListener,
    broadcaster: Broadcaster,
}

impl BroadcastServer {
    /// Bind the viewer port.
    pub async fn bind(addr: SocketAddr, broadcaster: Broadcaster) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Broadcast server listening");
        Ok(Self {
            listener,
            broadcaster,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept viewers until `shutdown` is raised.
    pub async fn run(self, shutdown: Interrupt) -> SyncResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Subscribe before spawning so the viewer counts immediately
                        let rx = self.broadcaster.subscribe();
                        let sessions = self.broadcaster.sessions.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            serve_viewer(stream, peer, rx, sessions, shutdown).await;
                        });
                    }
                    Err(e) => error!("Viewer accept error: {}", e),
                },
                _ = shutdown.raised() => {
                    info!("Broadcast server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_viewer(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    sessions: ViewerSessions,
    shutdown: Interrupt,
) {
    let _ = stream.set_nodelay(true);
    let session = sessions.open(peer).await;
    info!(%peer, session = %session.id, "Viewer connected");

    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 256];

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(%peer, "Viewer write failed: {}", e);
                        break;
                    }
                    sessions.record_sent(session.id).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "Viewer lagging, events dropped");
                    sessions.record_skipped(session.id, skipped).await;
                }
                Err(RecvError::Closed) => break,
            },
            // Viewers never send payloads; a read only tells us the socket closed
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => debug!(%peer, bytes = n, "Ignoring viewer payload"),
            },
            _ = shutdown.raised() => break,
        }
    }

    drop(rx);
    if let Some(closed) = sessions.close(session.id).await {
        info!(
            %peer,
            sent = closed.events_sent,
            connected_secs = closed.connected_for().num_seconds(),
            "Viewer disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::read_message;
    use std::time::Duration;

    #[test]
    fn publish_without_viewers_is_harmless() {
        let broadcaster = Broadcaster::new(4);
        assert_eq!(broadcaster.publish(&Event::Reset), 0);
        assert_eq!(broadcaster.viewer_count(), 0);
    }

    #[tokio::test]
    async fn viewer_receives_published_events() {
        let broadcaster = Broadcaster::new(8);
        let server = BroadcastServer::bind("127.0.0.1:0".parse().unwrap(), broadcaster.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Interrupt::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut viewer = TcpStream::connect(addr).await.unwrap();
        while broadcaster.viewer_count() < 1 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(broadcaster.publish(&Event::Reset), 1);
        let event: Event = read_message(&mut viewer).await.unwrap().unwrap();
        assert_eq!(event, Event::Reset);

        shutdown.raise();
        let closed: Option<Event> = read_message(&mut viewer).await.unwrap();
        assert!(closed.is_none());
    }
}
