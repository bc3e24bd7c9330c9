//! Privileged process-observer detector.
//!
//! Registers a listener on a privileged system channel (reached through a
//! helper such as Shizuku) that reports `(pid, uid, foreground)` changes as
//! they happen. No polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DetectorSink, ForegroundDetector};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{AppLockError, Result};
use crate::types::{BackendChoice, DetectionEvent, DetectionSource, PackageId};

/// Callback surface the privileged channel invokes, sequentially, on its
/// binder thread.
pub trait ProcessStateListener: Send + Sync {
    fn on_foreground_activities_changed(&self, pid: i32, uid: u32, foreground: bool);
    /// The remote end died or our permission was revoked.
    fn on_binder_died(&self);
}

pub trait ProcessObserverChannel: Send + Sync {
    /// Whether the privileged helper is reachable and has granted access.
    fn is_available(&self) -> bool;
    /// Returns a token for [`ProcessObserverChannel::unregister`].
    fn register(&self, listener: Arc<dyn ProcessStateListener>) -> Result<u64>;
    fn unregister(&self, token: u64);
    fn package_for_uid(&self, uid: u32) -> Option<PackageId>;
}

struct ObserverCallbacks {
    channel: Arc<dyn ProcessObserverChannel>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    active: AtomicBool,
    sink: Mutex<Option<DetectorSink>>,
    last_package: Mutex<Option<PackageId>>,
}

impl ObserverCallbacks {
    fn sink(&self) -> Option<DetectorSink> {
        lock(&self.sink).clone()
    }
}

impl ProcessStateListener for ObserverCallbacks {
    fn on_foreground_activities_changed(&self, pid: i32, uid: u32, foreground: bool) {
        if !foreground || !self.active.load(Ordering::SeqCst) {
            return;
        }

        let Some(package) = self.channel.package_for_uid(uid) else {
            tracing::debug!(pid, uid, "No package for foreground uid");
            return;
        };

        let previous = {
            let mut last = lock(&self.last_package);
            if last.as_deref() == Some(package.as_str()) {
                return;
            }
            last.replace(package.clone())
        };

        // Our overlay coming forward still updates `last_package` so the
        // return to the locked app counts as a change.
        if self.config.is_self(&package) || self.config.is_excluded(&package) {
            return;
        }

        let event = DetectionEvent::new(package, self.clock.now(), DetectionSource::ProcessObserver)
            .with_triggering(previous);
        if let Some(sink) = self.sink() {
            sink.detected(event);
        }
    }

    fn on_binder_died(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(backend = %BackendChoice::ProcessObserver, "Process observer binder died");
        if let Some(sink) = self.sink() {
            sink.failed(BackendChoice::ProcessObserver, "binder died");
        }
    }
}

pub struct ProcessObserverDetector {
    callbacks: Arc<ObserverCallbacks>,
    token: Mutex<Option<u64>>,
}

impl ProcessObserverDetector {
    pub fn new(
        channel: Arc<dyn ProcessObserverChannel>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            callbacks: Arc::new(ObserverCallbacks {
                channel,
                config,
                clock,
                active: AtomicBool::new(false),
                sink: Mutex::new(None),
                last_package: Mutex::new(None),
            }),
            token: Mutex::new(None),
        }
    }

    /// The listener registered with the channel. Exposed so hosts that
    /// deliver callbacks themselves can forward into it.
    pub fn listener(&self) -> Arc<dyn ProcessStateListener> {
        self.callbacks.clone()
    }
}

impl ForegroundDetector for ProcessObserverDetector {
    fn backend(&self) -> BackendChoice {
        BackendChoice::ProcessObserver
    }

    fn is_available(&self) -> bool {
        self.callbacks.channel.is_available()
    }

    fn start(&self, sink: DetectorSink) -> Result<()> {
        let mut token = lock(&self.token);
        if self.is_running() {
            return Err(AppLockError::AlreadyRunning {
                backend: self.backend(),
            });
        }
        if let Some(stale) = token.take() {
            // Stale token from a binder death.
            self.callbacks.channel.unregister(stale);
        }
        if !self.callbacks.channel.is_available() {
            return Err(AppLockError::PermissionUnavailable {
                backend: self.backend(),
            });
        }

        *lock(&self.callbacks.sink) = Some(sink);
        *lock(&self.callbacks.last_package) = None;
        self.callbacks.active.store(true, Ordering::SeqCst);

        match self.callbacks.channel.register(self.listener()) {
            Ok(registered) => {
                *token = Some(registered);
                tracing::info!(backend = %self.backend(), "Detector started");
                Ok(())
            }
            Err(err) => {
                self.callbacks.active.store(false, Ordering::SeqCst);
                lock(&self.callbacks.sink).take();
                Err(AppLockError::RegistrationFailed {
                    backend: self.backend(),
                    details: err.to_string(),
                })
            }
        }
    }

    fn stop(&self) {
        let was_active = self.callbacks.active.swap(false, Ordering::SeqCst);
        if let Some(registered) = lock(&self.token).take() {
            self.callbacks.channel.unregister(registered);
        }
        lock(&self.callbacks.sink).take();
        lock(&self.callbacks.last_package).take();
        if was_active {
            tracing::info!(backend = %self.backend(), "Detector stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.callbacks.active.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
