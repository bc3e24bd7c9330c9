//! Foreground detectors.
//!
//! Each backend implements [`ForegroundDetector`] over an injected platform
//! source. Detectors never call the decision engine directly: they publish
//! [`DetectorMessage`]s through a [`DetectorSink`], and the single
//! [`crate::service::LockService`] consumer evaluates them in arrival order.
//!
//! | Backend          | Driven by                        | Permission          |
//! |------------------|----------------------------------|---------------------|
//! | Accessibility    | host-delivered accessibility events | accessibility grant |
//! | UsageStats       | own timer thread                 | usage access        |
//! | ProcessObserver  | privileged callback              | privileged channel  |

pub mod accessibility;
pub mod process_observer;
pub mod usage_stats;

pub use accessibility::{
    AccessibilityDetector, AccessibilityEvent, AccessibilityEventKind, AccessibilityPlatform,
    ContentChange,
};
pub use process_observer::{ProcessObserverChannel, ProcessObserverDetector, ProcessStateListener};
pub use usage_stats::{ResumedActivity, UsageSnapshotEntry, UsageStatsDetector, UsageStatsSource};

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;
use crate::types::{BackendChoice, DetectionEvent, PackageId};

/// Everything a detector can tell the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorMessage {
    Detected(DetectionEvent),
    /// The backend stopped working while running (binder death, permission
    /// revoked). Triggers failover.
    Failed {
        backend: BackendChoice,
        reason: String,
    },
    /// The platform named a default home app that should count as a
    /// launcher.
    LauncherResolved(PackageId),
}

/// Sending half handed to a detector on start.
#[derive(Debug, Clone)]
pub struct DetectorSink {
    tx: Sender<DetectorMessage>,
}

impl DetectorSink {
    pub fn new(tx: Sender<DetectorMessage>) -> Self {
        Self { tx }
    }

    /// Creates an unbounded sink/receiver pair.
    pub fn channel() -> (Self, Receiver<DetectorMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    /// Returns false once the consumer is gone.
    pub fn send(&self, message: DetectorMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(message = ?err.0, "Detector consumer disconnected");
                false
            }
        }
    }

    pub fn detected(&self, event: DetectionEvent) -> bool {
        self.send(DetectorMessage::Detected(event))
    }

    pub fn failed(&self, backend: BackendChoice, reason: impl Into<String>) -> bool {
        self.send(DetectorMessage::Failed {
            backend,
            reason: reason.into(),
        })
    }
}

pub trait ForegroundDetector: Send + Sync {
    fn backend(&self) -> BackendChoice;

    /// Whether the backend's permission/channel is currently usable.
    fn is_available(&self) -> bool;

    /// Starts delivering messages to `sink`. Fails with
    /// [`crate::AppLockError::PermissionUnavailable`] or
    /// [`crate::AppLockError::RegistrationFailed`] when the backend cannot
    /// run, and with [`crate::AppLockError::AlreadyRunning`] if started twice.
    fn start(&self, sink: DetectorSink) -> Result<()>;

    /// Unregisters callbacks and joins any owned thread. Safe to call when
    /// not running.
    fn stop(&self);

    fn is_running(&self) -> bool;
}
