use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("file server {id} could not be started: {reason}")]
    Start { id: String, reason: String },

    #[error("file server at {address} did not become reachable within {timeout:?}")]
    NotReady { address: String, timeout: Duration },

    #[error("file server {id} could not be removed: {reason}")]
    Stop { id: String, reason: String },

    #[error("http service at {address} is not usable: {reason}")]
    Probe { address: String, reason: String },
}

/// Identifies a running (or about to run) file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarHandle {
    /// Runtime identifier; for docker this is the container name.
    pub id: String,
    /// `host:port` the server is published on.
    pub address: String,
    /// Directory the server exposes.
    pub serve_path: PathBuf,
}

impl SidecarHandle {
    /// Base URL the control plane fetches files from.
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// `host` when the port is the http default, `host:port` otherwise.
pub fn address(host: &str, port: u16) -> String {
    if port == 80 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarState {
    Absent,
    Starting,
    Ready,
    Stopped,
}

/// Ephemeral HTTP file server that exposes the staged image.
#[async_trait]
pub trait Sidecar: Send + Sync {
    /// Allocate the handle for the next start without running anything.
    fn prepare(&self, serve_path: &Path, host: &str, port: u16) -> SidecarHandle;

    async fn start(&self, handle: &SidecarHandle) -> Result<(), Error>;

    /// Poll the handle's address at a constant interval until it answers.
    async fn await_ready(&self, handle: &SidecarHandle, timeout: Duration) -> Result<(), Error>;

    /// Check that an already running system web server answers on `address`.
    async fn probe_existing(&self, address: &str) -> Result<(), Error>;

    /// Forcefully remove the server.
    async fn stop(&self, handle: &SidecarHandle) -> Result<(), Error>;
}

/// The sidecar currently owned by the pipeline, shared with the rollback path.
#[derive(Debug, Clone, Default)]
pub struct SidecarSlot {
    inner: Arc<Mutex<Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<SidecarHandle>,
    state: Option<SidecarState>,
}

impl SidecarSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle that is about to be started.
    pub fn starting(&self, handle: SidecarHandle) {
        let mut slot = self.lock();
        slot.handle = Some(handle);
        slot.state = Some(SidecarState::Starting);
    }

    pub fn ready(&self) {
        let mut slot = self.lock();
        if slot.handle.is_some() {
            slot.state = Some(SidecarState::Ready);
        }
    }

    /// Take the handle out so exactly one caller tears it down.
    pub fn take(&self) -> Option<SidecarHandle> {
        let mut slot = self.lock();
        let handle = slot.handle.take();
        if handle.is_some() {
            slot.state = Some(SidecarState::Stopped);
        }
        handle
    }

    pub fn state(&self) -> SidecarState {
        self.lock().state.unwrap_or(SidecarState::Absent)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // A poisoned slot still holds a valid handle; keep using it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
