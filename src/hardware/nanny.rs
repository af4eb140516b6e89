//! Device nanny
//!
//! Owns the camera connector and the single cached camera session. Workers
//! call [`DeviceNanny::acquire`], which blocks (with a fixed backoff) until
//! the hardware answers, and receive a [`DeviceLease`] that gives them
//! exclusive use of the camera until it is released or dropped.
//!
//! The cache holds the last successfully opened camera, keyed by its
//! `camera_id`. A request for the same id reuses the session, reopening it
//! if the driver reports it closed; a request for a different id closes the
//! cached session and opens a new one. Parameters are applied on every
//! acquire, cache hit or not.

use crate::acquisition::Interrupt;
use crate::config::NannyConfig;
use crate::error::{SyncError, SyncResult};
use crate::hardware::{Camera, CameraConnector, CameraParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

struct CachedCamera {
    camera_id: String,
    camera: SharedCamera,
}

/// Acquires, caches and reconfigures the physical camera.
pub struct DeviceNanny {
    connector: Arc<dyn CameraConnector>,
    cache: Mutex<Option<CachedCamera>>,
    retry_interval: Duration,
    notice_every: u32,
}

impl DeviceNanny {
    /// Create a nanny around an explicitly constructed connector.
    pub fn new(connector: Arc<dyn CameraConnector>, config: &NannyConfig) -> Self {
        Self {
            connector,
            cache: Mutex::new(None),
            retry_interval: config.retry_interval,
            notice_every: config.notice_every.max(1),
        }
    }

    /// Block until the camera described by `params` is open and configured.
    ///
    /// Device failures are retried with a fixed backoff and never returned;
    /// the only errors are `Interrupted` (the flag was raised while waiting)
    /// and the caller dropping the future.
    pub async fn acquire(
        &self,
        params: &CameraParams,
        interrupt: &Interrupt,
    ) -> SyncResult<DeviceLease> {
        let mut attempt: u32 = 0;
        loop {
            if interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }

            match self.try_acquire(params, interrupt).await {
                Ok(lease) => {
                    if attempt > 0 {
                        info!(camera_id = %params.camera_id, attempt, "Camera available again");
                    }
                    return Ok(lease);
                }
                Err(SyncError::DeviceUnavailable { message, .. }) => {
                    attempt += 1;
                    if attempt % self.notice_every == 1 || self.notice_every == 1 {
                        warn!(
                            camera_id = %params.camera_id,
                            attempt,
                            "Camera unavailable ({}), retrying every {:?}",
                            message,
                            self.retry_interval
                        );
                    } else {
                        debug!(camera_id = %params.camera_id, attempt, "Camera still unavailable");
                    }
                    if interrupt.sleep(self.retry_interval).await {
                        return Err(SyncError::Interrupted);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn try_acquire(
        &self,
        params: &CameraParams,
        interrupt: &Interrupt,
    ) -> SyncResult<DeviceLease> {
        let shared = self.cached_or_connect(params, interrupt).await?;
        let mut guard = Self::lock_exclusive(shared, interrupt, self.retry_interval).await?;

        if !guard.is_open() {
            debug!(camera_id = %params.camera_id, "Opening camera session");
            guard
                .open()
                .await
                .map_err(|e| SyncError::device(&params.camera_id, e))?;
        }

        if guard.is_grabbing() {
            // Left armed by a previous owner that never released properly
            guard
                .stop_grab()
                .await
                .map_err(|e| SyncError::device(&params.camera_id, e))?;
        }

        guard
            .configure(params)
            .await
            .map_err(|e| SyncError::device(&params.camera_id, e))?;

        Ok(DeviceLease {
            camera_id: params.camera_id.clone(),
            guard: Some(guard),
        })
    }

    async fn cached_or_connect(
        &self,
        params: &CameraParams,
        interrupt: &Interrupt,
    ) -> SyncResult<SharedCamera> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if cached.camera_id == params.camera_id {
                return Ok(Arc::clone(&cached.camera));
            }
        }

        if let Some(previous) = cache.as_ref() {
            info!(
                old = %previous.camera_id,
                new = %params.camera_id,
                "Switching cameras, closing cached session"
            );
            // May still be leased; stays cached until closed
            let mut camera =
                Self::lock_exclusive(Arc::clone(&previous.camera), interrupt, self.retry_interval)
                    .await?;
            if let Err(e) = camera.close().await {
                warn!(camera_id = %previous.camera_id, "Close failed: {}", e);
            }
            drop(camera);
            *cache = None;
        }

        let camera = self
            .connector
            .connect(params)
            .await
            .map_err(|e| SyncError::device(&params.camera_id, e))?;
        info!(camera_id = %params.camera_id, device = %camera.id(), "Camera session created");
        let shared: SharedCamera = Arc::new(Mutex::new(camera));
        *cache = Some(CachedCamera {
            camera_id: params.camera_id.clone(),
            camera: Arc::clone(&shared),
        });
        Ok(shared)
    }

    /// Wait for exclusive use of the camera, polling the interrupt flag.
    async fn lock_exclusive(
        shared: SharedCamera,
        interrupt: &Interrupt,
        poll: Duration,
    ) -> SyncResult<OwnedMutexGuard<Box<dyn Camera>>> {
        loop {
            match Arc::clone(&shared).try_lock_owned() {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    debug!("Camera held by another worker, waiting");
                    if interrupt.sleep(poll).await {
                        return Err(SyncError::Interrupted);
                    }
                }
            }
        }
    }

    /// Close and forget the cached camera (component shutdown).
    pub async fn shutdown(&self) {
        if let Some(cached) = self.cache.lock().await.take() {
            let mut camera = cached.camera.lock().await;
            if let Err(e) = camera.close().await {
                warn!(camera_id = %cached.camera_id, "Close on shutdown failed: {}", e);
            }
            info!(camera_id = %cached.camera_id, "Camera session closed");
        }
    }

    /// Identity of the cached camera, if any.
    pub async fn cached_camera_id(&self) -> Option<String> {
        self.cache.lock().await.as_ref().map(|c| c.camera_id.clone())
    }
}

/// Exclusive use of the cached camera for one run.
pub struct DeviceLease {
    camera_id: String,
    guard: Option<OwnedMutexGuard<Box<dyn Camera>>>,
}

impl DeviceLease {
    /// Identity of the leased camera.
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Mutable access to the camera while the lease is held.
    pub fn camera(&mut self) -> SyncResult<&mut Box<dyn Camera>> {
        match self.guard.as_mut() {
            Some(guard) => Ok(&mut **guard),
            None => Err(SyncError::device(&self.camera_id, "lease already released")),
        }
    }

    /// Whether the lease still holds the camera.
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Stop any active grab and give the camera back to the nanny.
    ///
    /// Idempotent; the session stays open in the cache for the next run.
    pub async fn release(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if guard.is_grabbing() {
                if let Err(e) = guard.stop_grab().await {
                    warn!(camera_id = %self.camera_id, "stop_grab on release failed: {}", e);
                }
            }
            debug!(camera_id = %self.camera_id, "Camera lease released");
        }
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("camera_id", &self.camera_id)
            .field("held", &self.is_held())
            .finish()
    }
}
