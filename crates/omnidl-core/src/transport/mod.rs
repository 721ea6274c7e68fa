//! Transports - protocol-specific transfer engines
//!
//! A transport performs one resumable transfer per task. The scheduler
//! looks transports up by protocol, starts them, and steers them through
//! the returned [`TransferHandle`]:
//! - `pause` stops the data flow and keeps the partial artifact
//! - `resume` restarts from whatever the artifact holds
//! - `abort` stops the data flow and deletes the artifact

mod artifact;
mod http;
mod rate_limiter;

pub use artifact::*;
pub use http::*;
pub use rate_limiter::*;

use crate::error::CoreError;
use async_trait::async_trait;
use omnidl_types::{Protocol, Settings, Task, TaskId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything a transport needs to know about one transfer
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub artifact: PathBuf,
    /// Trust an existing artifact; when false a leftover artifact is stale
    pub resume: bool,
}

impl TransferJob {
    pub fn for_task(task: &Task, resume: bool) -> Self {
        Self {
            task_id: task.id,
            url: task.url.clone(),
            destination: task.destination(),
            artifact: task.artifact_path(),
            resume,
        }
    }
}

/// Sample reported at most once per throttling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes present in the artifact, including resumed ones
    pub received: u64,
    pub total: Option<u64>,
    pub progress: u8,
    /// Bytes per second over the last window
    pub speed: u64,
}

/// Callback receiving progress samples
pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Final figures of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub total_size: u64,
}

/// Requested state of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    Run,
    Pause,
    Abort,
}

/// Control side of a transfer
///
/// Dropping every clone detaches the transfer: a paused transfer then
/// settles with [`CoreError::Paused`] and keeps its artifact.
#[derive(Clone)]
pub struct TransferControl {
    tx: Arc<watch::Sender<TransferSignal>>,
}

impl TransferControl {
    /// Control plus the receiving end the transfer listens on
    pub fn channel() -> (Self, watch::Receiver<TransferSignal>) {
        let (tx, rx) = watch::channel(TransferSignal::Run);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Stop the data flow, keeping the artifact. No-op unless running.
    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == TransferSignal::Run {
                *signal = TransferSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Continue a paused transfer from its artifact. No-op unless paused.
    pub fn resume(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == TransferSignal::Pause {
                *signal = TransferSignal::Run;
                true
            } else {
                false
            }
        });
    }

    /// Stop the data flow and delete the artifact. Idempotent.
    pub fn abort(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == TransferSignal::Abort {
                false
            } else {
                *signal = TransferSignal::Abort;
                true
            }
        });
    }

    pub fn signal(&self) -> TransferSignal {
        *self.tx.borrow()
    }
}

/// Eventual result of a transfer
pub struct TransferOutcome {
    inner: JoinHandle<Result<TransferSummary, CoreError>>,
}

impl TransferOutcome {
    pub fn new(inner: JoinHandle<Result<TransferSummary, CoreError>>) -> Self {
        Self { inner }
    }

    /// Wait for the transfer to settle
    pub async fn wait(self) -> Result<TransferSummary, CoreError> {
        match self.inner.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CoreError::Cancelled),
            Err(e) => Err(CoreError::Unknown(format!("Transfer task panicked: {}", e))),
        }
    }
}

/// Handle returned by [`Transport::start`]: control and result kept apart
pub struct TransferHandle {
    pub control: TransferControl,
    pub outcome: TransferOutcome,
}

impl TransferHandle {
    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn into_parts(self) -> (TransferControl, TransferOutcome) {
        (self.control, self.outcome)
    }
}

/// A protocol-specific transfer engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin a transfer in the background; must be called inside a tokio runtime
    fn start(&self, job: TransferJob, progress: ProgressSink) -> TransferHandle;

    /// Delete the partial artifact of a transfer that is not running
    async fn discard(&self, job: &TransferJob) -> Result<(), CoreError>;

    /// Pick up changed settings
    fn reconfigure(&self, _settings: &Settings) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Lookup table from protocol to transport
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Protocol, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP transport for `http` and `https`
    pub fn with_defaults(settings: &Settings) -> Result<Self, CoreError> {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(settings)?);
        let mut registry = Self::new();
        registry.register(Protocol::Http, http.clone());
        registry.register(Protocol::Https, http);
        Ok(registry)
    }

    pub fn register(&mut self, protocol: Protocol, transport: Arc<dyn Transport>) {
        self.transports.insert(protocol, transport);
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Transport>> {
        self.transports.get(&protocol).cloned()
    }

    /// Every distinct transport once, for broadcasting settings
    pub fn unique(&self) -> Vec<Arc<dyn Transport>> {
        let mut seen: Vec<Arc<dyn Transport>> = Vec::new();
        for transport in self.transports.values() {
            let ptr = Arc::as_ptr(transport) as *const ();
            if !seen.iter().any(|t| Arc::as_ptr(t) as *const () == ptr) {
                seen.push(transport.clone());
            }
        }
        seen
    }
}
