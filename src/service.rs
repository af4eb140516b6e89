//! Imaging process composition
//!
//! [`ImagingService`] wires the pieces of the camera side together:
//!
//! - a [`RunWatcher`] polling the mailbox for the run the sequencer announced
//! - a [`RunPipeline`] that starts one worker/writer pair per detected run
//! - a [`CommandServer`] answering the sequencer through a [`RunController`]
//! - a [`BroadcastServer`] pushing lifecycle and frame events to viewers
//!
//! The device nanny and its connector are built here and owned by the
//! service; nothing about the camera library lives in process-wide state.

use crate::acquisition::{Interrupt, RunHandle, RunPhase, RunPipeline, RunStatus, RunWatcher};
use crate::config::{AcquisitionConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::hardware::nanny::DeviceNanny;
use crate::hardware::{CameraConnector, CameraParams};
use crate::mailbox::{remove_record, RecordStore, RunId, RunRecord};
use crate::network::broadcast::{BroadcastServer, Broadcaster};
use crate::network::command::{CommandServer, RequestHandler};
use crate::network::protocol::{Event, NewRun, Request, Response, StatusReport, Vars};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Run state behind the command channel.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    store: Arc<dyn RecordStore>,
    pipeline: RunPipeline,
    broadcaster: Broadcaster,
    config: AcquisitionConfig,
    default_camera: CameraParams,
    expected: watch::Sender<Option<RunId>>,
    started: watch::Sender<Option<Arc<RunStatus>>>,
    pending: Mutex<HashMap<RunId, NewRun>>,
    active: tokio::sync::Mutex<Option<RunHandle>>,
}

impl RunController {
    /// Create a controller over an existing pipeline.
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: RunPipeline,
        broadcaster: Broadcaster,
        config: AcquisitionConfig,
        default_camera: CameraParams,
    ) -> Self {
        let (expected, _) = watch::channel(None);
        let (started, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControllerInner {
                store,
                pipeline,
                broadcaster,
                config,
                default_camera,
                expected,
                started,
                pending: Mutex::new(HashMap::new()),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Run id the watcher should be looking for.
    pub fn expected_runs(&self) -> watch::Receiver<Option<RunId>> {
        self.inner.expected.subscribe()
    }

    /// Status of the most recently started run.
    pub async fn current_run(&self) -> Option<Arc<RunStatus>> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|handle| Arc::clone(handle.status()))
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, NewRun>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the pipeline for a record the watcher found.
    pub async fn dispatch(&self, record: RunRecord) {
        let run_id = record.run_id();
        let params = match self.pending().remove(&run_id) {
            Some(run) => run.camera,
            None => {
                warn!(run_id, "No new_run seen for this record, using default camera settings");
                self.inner.default_camera.clone()
            }
        };

        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.is_finished() {
                warn!(
                    old = previous.run_id(),
                    new = run_id,
                    "New run arrived before the previous one finished, interrupting it"
                );
                previous.interrupt();
            }
        }

        let handle = self.inner.pipeline.start(record, params);
        self.inner
            .started
            .send_replace(Some(Arc::clone(handle.status())));
        *active = Some(handle);
    }

    async fn new_run(&self, run: NewRun) -> Response {
        let run_id = run.run_id;
        if run.expected_frame_count == 0 || run.subframes_per_shot == 0 {
            return Response::error(format!(
                "run {run_id}: expected_frame_count and subframes_per_shot must be positive"
            ));
        }

        info!(run_id, filepath = %run.filepath, frames = run.expected_frame_count, "new_run received");
        self.inner.broadcaster.publish(&Event::RunStart {
            run_id,
            filepath: run.filepath.clone(),
            expected_frame_count: run.expected_frame_count,
            shot_count: run.shot_count,
            subframes_per_shot: run.subframes_per_shot,
            imaging_mode: run.imaging_mode,
        });

        let mut started = self.inner.started.subscribe();
        self.pending().insert(run_id, run);
        self.inner.expected.send_replace(Some(run_id));

        let limit = self.inner.config.camera_ready_timeout;
        let waited = timeout(limit, async {
            let status = started
                .wait_for(|s| s.as_ref().is_some_and(|s| s.run_id() == run_id))
                .await
                .ok()?
                .clone()?;
            Some(status.wait_past_start().await)
        })
        .await;

        match waited {
            Ok(Some(RunPhase::CameraReady | RunPhase::Complete)) => {
                info!(run_id, "Camera ready");
                Response::CameraReady { run_id }
            }
            Ok(_) => Response::error(format!("run {run_id} failed before the camera was ready")),
            Err(_) => {
                warn!(run_id, ?limit, "Camera not ready in time, abandoning run");
                self.abandon(run_id).await;
                Response::error(SyncError::timeout(
                    format!("camera_ready for run {run_id}"),
                    limit,
                ))
            }
        }
    }

    /// Forget a run that never became ready.
    async fn abandon(&self, run_id: RunId) {
        self.pending().remove(&run_id);
        self.inner.expected.send_if_modified(|expected| {
            if *expected == Some(run_id) {
                *expected = None;
                true
            } else {
                false
            }
        });
        if let Some(handle) = self.inner.active.lock().await.as_ref() {
            if handle.run_id() == run_id {
                handle.interrupt();
            }
        }
    }

    fn xvars(&self, vars: Vars) -> Response {
        let delivered = self.inner.broadcaster.publish(&Event::Xvars { vars });
        debug!(viewers = delivered, "xvars forwarded");
        Response::Ack
    }

    async fn run_complete(&self) -> Response {
        let Some(status) = self.current_run().await else {
            debug!("run_complete with no active run");
            return Response::Ack;
        };
        let run_id = status.run_id();
        let grace = self.inner.config.completion_grace;

        if timeout(grace, status.wait_finished()).await.is_err() {
            warn!(
                run_id,
                written = status.frames_written(),
                expected = status.expected_frame_count(),
                "Frames still missing after grace period, interrupting run"
            );
            if let Some(handle) = self.inner.active.lock().await.as_ref() {
                if handle.run_id() == run_id {
                    handle.interrupt();
                }
            }
            let teardown = grace + self.inner.config.grab_timeout;
            if timeout(teardown, status.wait_finished()).await.is_err() {
                error!(run_id, "Run did not stop after interruption");
            }
        }
        Response::Ack
    }

    fn status(&self, status: Option<Arc<RunStatus>>) -> Response {
        let mut report = StatusReport {
            viewers: self.inner.broadcaster.viewer_count(),
            ..Default::default()
        };
        if let Some(status) = status {
            report.camera_ready = status.camera_ready();
            report.grab_active = status.grab_active();
            report.run_id = Some(status.run_id());
            report.frames_written = status.frames_written();
            report.expected_frame_count = status.expected_frame_count();
        }
        Response::Status(report)
    }

    async fn reset(&self) -> Response {
        self.pending().clear();
        self.inner.expected.send_replace(None);

        let handle = self.inner.active.lock().await.take();
        let mut result = Ok(());
        if let Some(handle) = handle {
            let run_id = handle.run_id();
            let status = Arc::clone(handle.status());
            warn!(run_id, "Reset requested, stopping run");
            handle.interrupt();
            let teardown = self.inner.config.grab_timeout + self.inner.config.completion_grace;
            match timeout(teardown, handle.join()).await {
                Ok(Ok(report)) => debug!(run_id, complete = report.complete, "Run stopped"),
                Ok(Err(e)) => error!(run_id, "Run task failed: {}", e),
                Err(_) => error!(run_id, "Run did not stop within {:?}", teardown),
            }
            // A finished frame table belongs to the sequencer now
            if status.phase() == RunPhase::Complete {
                info!(run_id, "Keeping completed run record");
            } else {
                result = remove_record(self.inner.store.as_ref(), run_id).await.map(|_| ());
            }
        }

        self.inner.broadcaster.publish(&Event::Reset);
        match result {
            Ok(()) => {
                info!("Reset to idle");
                Response::Ack
            }
            Err(e) => Response::error(e),
        }
    }
}

#[async_trait]
impl RequestHandler for RunController {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::NewRun(run) => self.new_run(run).await,
            Request::Xvars { vars } => self.xvars(vars),
            Request::RunComplete => self.run_complete().await,
            Request::Status => {
                let current = self.current_run().await;
                self.status(current)
            }
            Request::Reset => self.reset().await,
        }
    }
}

/// The imaging process: watcher, pipelines, command and broadcast servers.
pub struct ImagingService {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    connector: Arc<dyn CameraConnector>,
}

/// A running [`ImagingService`].
pub struct ServiceHandle {
    command_addr: SocketAddr,
    viewer_addr: SocketAddr,
    controller: RunController,
    broadcaster: Broadcaster,
    nanny: Arc<DeviceNanny>,
    shutdown: Interrupt,
    tasks: Vec<JoinHandle<()>>,
}

impl ImagingService {
    /// Assemble a service from configuration and explicitly owned resources.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RecordStore>,
        connector: Arc<dyn CameraConnector>,
    ) -> Self {
        Self {
            config,
            store,
            connector,
        }
    }

    /// Bind both ports and start every background task.
    pub async fn start(self) -> SyncResult<ServiceHandle> {
        let config = self.config;
        let broadcaster = Broadcaster::default();
        let nanny = Arc::new(DeviceNanny::new(self.connector, &config.nanny));
        let policy = config.mailbox.poll_policy();

        let pipeline = RunPipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&nanny),
            broadcaster.clone(),
            policy,
            config.acquisition.clone(),
        );
        let controller = RunController::new(
            Arc::clone(&self.store),
            pipeline,
            broadcaster.clone(),
            config.acquisition.clone(),
            config.camera.clone(),
        );

        let shutdown = Interrupt::new();
        let command =
            CommandServer::bind(config.network.command_addr()?, Arc::new(controller.clone()))
                .await?;
        let viewers = BroadcastServer::bind(config.network.viewer_addr()?, broadcaster.clone()).await?;
        let command_addr = command.local_addr()?;
        let viewer_addr = viewers.local_addr()?;

        let mut tasks = Vec::new();
        {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = command.run(shutdown).await {
                    error!("Command server failed: {}", e);
                }
            }));
        }
        {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = viewers.run(shutdown).await {
                    error!("Broadcast server failed: {}", e);
                }
            }));
        }
        {
            let watcher = RunWatcher::new(
                Arc::clone(&self.store),
                controller.expected_runs(),
                config.mailbox.poll_interval,
            );
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(
                watch_runs(watcher, controller, shutdown).instrument(info_span!("watcher")),
            ));
        }

        info!(%command_addr, %viewer_addr, "Imaging service started");
        Ok(ServiceHandle {
            command_addr,
            viewer_addr,
            controller,
            broadcaster,
            nanny,
            shutdown,
            tasks,
        })
    }
}

async fn watch_runs(watcher: RunWatcher, controller: RunController, shutdown: Interrupt) {
    let runs = watcher.into_stream();
    tokio::pin!(runs);
    loop {
        tokio::select! {
            next = runs.next() => match next {
                Some(Ok(record)) => controller.dispatch(record).await,
                Some(Err(e)) => {
                    error!("Run watcher failed: {}", e);
                    return;
                }
                None => return,
            },
            _ = shutdown.raised() => return,
        }
    }
}

impl ServiceHandle {
    /// Bound command address.
    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    /// Bound viewer address.
    pub fn viewer_addr(&self) -> SocketAddr {
        self.viewer_addr
    }

    /// Controller behind the command channel.
    pub fn controller(&self) -> &RunController {
        &self.controller
    }

    /// Event publisher shared with the pipelines.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Stop every task, interrupt any active run and close the camera.
    pub async fn shutdown(self) {
        info!("Imaging service shutting down");
        self.shutdown.raise();
        if let Some(handle) = self.controller.inner.active.lock().await.take() {
            handle.interrupt();
            let limit = self.controller.inner.config.grab_timeout + Duration::from_secs(1);
            if timeout(limit, handle.join()).await.is_err() {
                warn!("Active run did not stop before shutdown");
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Service task ended abnormally: {}", e);
            }
        }
        self.nanny.shutdown().await;
    }
}
