//! Command channel between the sequencer and the imaging process.
//!
//! Strict request/response: each decoded [`Request`] is handed to a
//! [`RequestHandler`] and exactly one [`Response`] is written back before
//! the next request is read. A connection may be kept open for a whole run.

use crate::acquisition::Interrupt;
use crate::error::{SyncError, SyncResult};
use crate::network::protocol::{
    read_message, write_message, NewRun, Request, Response, StatusReport, Vars,
};
use crate::mailbox::RunId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Server-side logic behind the command channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the single response to `request`.
    async fn handle(&self, request: Request) -> Response;
}

/// Accepts command connections.
pub struct CommandServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
}

impl CommandServer {
    /// Bind the command port.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Command server listening");
        Ok(Self { listener, handler })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until `shutdown` is raised.
    pub async fn run(self, shutdown: Interrupt) -> SyncResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, peer, handler, shutdown).await {
                                warn!(%peer, "Command client error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Command accept error: {}", e),
                },
                _ = shutdown.raised() => {
                    info!("Command server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    shutdown: Interrupt,
) -> SyncResult<()> {
    info!(%peer, "Command client connected");
    let _ = stream.set_nodelay(true);

    loop {
        let received = tokio::select! {
            received = read_message::<_, Request>(&mut stream) => received,
            _ = shutdown.raised() => return Ok(()),
        };

        let response = match received {
            Ok(Some(request)) => {
                debug!(%peer, cmd = request.name(), "Request received");
                handler.handle(request).await
            }
            Ok(None) => {
                info!(%peer, "Command client disconnected");
                return Ok(());
            }
            Err(SyncError::Codec(message)) => {
                warn!(%peer, "Undecodable request: {}", message);
                Response::error(format!("undecodable request: {message}"))
            }
            Err(e) => return Err(e),
        };

        write_message(&mut stream, &response).await?;
    }
}

/// Sequencer-side connection to the command server.
///
/// The connection is opened lazily and dropped after any failed exchange, so
/// a late reply to a timed-out request can never be mistaken for the answer
/// to the next one.
pub struct CommandClient {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    request_timeout: Duration,
}

impl CommandClient {
    /// Client for `addr`; plain requests time out after `request_timeout`.
    pub fn new(addr: SocketAddr, request_timeout: Duration) -> Self {
        Self {
            addr,
            stream: None,
            request_timeout,
        }
    }

    /// Connect eagerly, failing fast if the server is not there.
    pub async fn connect(addr: SocketAddr, request_timeout: Duration) -> SyncResult<Self> {
        let mut client = Self::new(addr, request_timeout);
        client.ensure_connected().await?;
        Ok(client)
    }

    async fn ensure_connected(&mut self) -> SyncResult<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| SyncError::ConnectionLost(format!("{}: {e}", self.addr)))?;
            let _ = stream.set_nodelay(true);
            debug!(addr = %self.addr, "Command connection opened");
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| SyncError::ConnectionLost(self.addr.to_string()))
    }

    /// Send one request and wait up to `limit` for its response.
    pub async fn request(&mut self, request: &Request, limit: Duration) -> SyncResult<Response> {
        let name = request.name();
        let stream = self.ensure_connected().await?;
        let exchange = async {
            write_message(&mut *stream, request).await?;
            read_message::<_, Response>(&mut *stream).await?.ok_or_else(|| {
                SyncError::ConnectionLost(format!("server closed connection during {name}"))
            })
        };

        let result = match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(format!("{name} response"), limit)),
        };
        if result.is_err() {
            self.stream = None;
        }
        match result? {
            Response::Error { message } => Err(SyncError::Remote(message)),
            response => Ok(response),
        }
    }

    /// Announce a run and wait for the camera to be armed.
    pub async fn new_run(&mut self, run: NewRun, limit: Duration) -> SyncResult<RunId> {
        let run_id = run.run_id;
        match self.request(&Request::NewRun(run), limit).await? {
            Response::CameraReady { run_id: ready } if ready == run_id => Ok(ready),
            other => Err(unexpected("new_run", &other)),
        }
    }

    /// Forward a variable snapshot.
    pub async fn xvars(&mut self, vars: Vars) -> SyncResult<()> {
        let limit = self.request_timeout;
        self.expect_ack("xvars", &Request::Xvars { vars }, limit).await
    }

    /// Tell the imaging process the sequence has finished.
    ///
    /// The server may wait for outstanding frames, so allow for that in `limit`.
    pub async fn run_complete(&mut self, limit: Duration) -> SyncResult<()> {
        self.expect_ack("run_complete", &Request::RunComplete, limit)
            .await
    }

    /// Query live state.
    pub async fn status(&mut self) -> SyncResult<StatusReport> {
        let limit = self.request_timeout;
        match self.request(&Request::Status, limit).await? {
            Response::Status(report) => Ok(report),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Abort the current run.
    pub async fn reset(&mut self) -> SyncResult<()> {
        let limit = self.request_timeout;
        self.expect_ack("reset", &Request::Reset, limit).await
    }

    async fn expect_ack(
        &mut self,
        name: &str,
        request: &Request,
        limit: Duration,
    ) -> SyncResult<()> {
        match self.request(request, limit).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }
}

fn unexpected(name: &str, response: &Response) -> SyncError {
    SyncError::ProtocolDesync(format!("unexpected reply to {name}: {response:?}"))
}
