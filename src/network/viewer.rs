//! Viewer client with unbounded reconnect.
//!
//! Connects to a broadcast server, decodes events and hands them to the
//! registered callbacks. Any socket error or clean close is followed by a
//! fixed pause and another attempt; the only visible trace of an outage is
//! a `connection_status(false)` / `connection_status(true)` pair.

use crate::acquisition::Interrupt;
use crate::network::protocol::{read_message, Event};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Subscriber to a broadcast server.
pub struct ViewerClient {
    addr: SocketAddr,
    reconnect_interval: Duration,
    on_event: Vec<EventCallback>,
    on_status: Vec<StatusCallback>,
}

/// Running viewer loop.
pub struct ViewerHandle {
    stop: Interrupt,
    task: JoinHandle<()>,
}

impl ViewerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.stop.raise();
        if let Err(e) = self.task.await {
            warn!("Viewer task ended abnormally: {}", e);
        }
    }
}

impl ViewerClient {
    /// Viewer for `addr`, retrying every `reconnect_interval`.
    pub fn new(addr: SocketAddr, reconnect_interval: Duration) -> Self {
        Self {
            addr,
            reconnect_interval,
            on_event: Vec::new(),
            on_status: Vec::new(),
        }
    }

    /// Register an event callback.
    pub fn on_event(mut self, callback: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_event.push(Arc::new(callback));
        self
    }

    /// Register a connectivity callback; called on every change.
    pub fn on_connection_status(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_status.push(Arc::new(callback));
        self
    }

    /// Start the background loop.
    pub fn spawn(self) -> ViewerHandle {
        let stop = Interrupt::new();
        let span = info_span!("viewer", addr = %self.addr);
        let task = tokio::spawn(self.run(stop.clone()).instrument(span));
        ViewerHandle { stop, task }
    }

    /// Connect, receive, reconnect, until `stop` is raised.
    pub async fn run(self, stop: Interrupt) {
        let mut connected: Option<bool> = None;

        while !stop.is_raised() {
            match TcpStream::connect(self.addr).await {
                Ok(mut stream) => {
                    let _ = stream.set_nodelay(true);
                    self.report(&mut connected, true);
                    info!("Connected to broadcast server");
                    self.receive(&mut stream, &stop).await;
                    self.report(&mut connected, false);
                }
                Err(e) => {
                    debug!("Connect failed: {}", e);
                    self.report(&mut connected, false);
                }
            }

            if stop.sleep(self.reconnect_interval).await {
                break;
            }
        }
        debug!("Viewer loop stopped");
    }

    async fn receive(&self, stream: &mut TcpStream, stop: &Interrupt) {
        loop {
            let message = tokio::select! {
                message = read_message::<_, Event>(stream) => message,
                _ = stop.raised() => return,
            };
            match message {
                Ok(Some(event)) => {
                    for callback in &self.on_event {
                        callback(&event);
                    }
                }
                Ok(None) => {
                    info!("Broadcast server closed the connection");
                    return;
                }
                Err(e) => {
                    warn!("Broadcast receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn report(&self, connected: &mut Option<bool>, now: bool) {
        if *connected == Some(now) {
            return;
        }
        *connected = Some(now);
        for callback in &self.on_status {
            callback(now);
        }
    }
}
