//! Usage-stats poll detector.
//!
//! A single timer thread polls the platform's usage-event log. The newest
//! activity-resumed event in the trailing window names the foreground app;
//! when the log is empty (some OEMs drop resume events) the coarse per-app
//! `last_time_used` snapshot is used instead.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::{DetectorSink, ForegroundDetector};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{AppLockError, Result};
use crate::registry::LockedAppRegistry;
use crate::state::LockState;
use crate::types::{latest_event, BackendChoice, DetectionEvent, DetectionSource, PackageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumedActivity {
    pub package: PackageId,
    #[serde(default)]
    pub class_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshotEntry {
    pub package: PackageId,
    pub last_time_used: DateTime<Utc>,
}

pub trait UsageStatsSource: Send + Sync {
    fn has_permission(&self) -> bool;
    fn is_device_locked(&self) -> bool;
    fn input_method_packages(&self) -> HashSet<PackageId>;
    /// Activity-resumed events with timestamps in `[from, to]`.
    fn resumed_activities(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResumedActivity>>;
    fn usage_snapshot(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshotEntry>>;
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Shared between the detector handle and its timer thread.
struct Poller {
    source: Arc<dyn UsageStatsSource>,
    registry: Arc<dyn LockedAppRegistry>,
    state: Arc<LockState>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    last_emitted: Mutex<Option<(PackageId, DateTime<Utc>)>>,
}

pub struct UsageStatsDetector {
    poller: Arc<Poller>,
    worker: Mutex<Option<Worker>>,
    running: Arc<AtomicBool>,
}

impl UsageStatsDetector {
    pub fn new(
        source: Arc<dyn UsageStatsSource>,
        registry: Arc<dyn LockedAppRegistry>,
        state: Arc<LockState>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            poller: Arc::new(Poller {
                source,
                registry,
                state,
                config,
                clock,
                last_emitted: Mutex::new(None),
            }),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one poll cycle synchronously and returns what it would emit.
    /// The timer thread calls the same logic.
    pub fn poll_once(&self) -> Option<DetectionEvent> {
        self.poller.tick()
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Poller {
    fn tick(&self) -> Option<DetectionEvent> {
        let device_locked = self.source.is_device_locked();
        if device_locked || !self.registry.is_protect_enabled() {
            self.state.clear_temporarily_unlocked();
            if device_locked {
                self.state.clear_unlock_timestamps();
            }
            return None;
        }

        let now = self.clock.now();
        let (package, source_time) = self.resolve_foreground(now)?;

        let inputs = self.source.input_method_packages();
        if self.config.should_skip(&package, &inputs) {
            return None;
        }

        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.as_ref() == Some(&(package.clone(), source_time)) {
            return None;
        }
        let previous = last.replace((package.clone(), source_time)).map(|(pkg, _)| pkg);

        Some(
            DetectionEvent::new(package, now, DetectionSource::UsageStats)
                .with_triggering(previous),
        )
    }

    /// Newest resumed activity, else the most recently used app from the
    /// snapshot. Query failures count as "nothing detected".
    fn resolve_foreground(&self, now: DateTime<Utc>) -> Option<(PackageId, DateTime<Utc>)> {
        let resumed = match self
            .source
            .resumed_activities(now - self.config.event_window(), now)
        {
            Ok(resumed) => resumed,
            Err(err) => {
                tracing::warn!(error = %err, "Usage event query failed");
                Vec::new()
            }
        };

        let candidates = resumed.into_iter().filter(|activity| {
            !activity
                .class_name
                .as_deref()
                .is_some_and(|class| self.config.is_transient_system_class(class))
        });
        if let Some(activity) = latest_event(candidates, |activity| activity.timestamp) {
            return Some((activity.package, activity.timestamp));
        }

        let snapshot = match self
            .source
            .usage_snapshot(now - self.config.snapshot_window(), now)
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "Usage snapshot query failed");
                return None;
            }
        };

        latest_event(snapshot, |entry| entry.last_time_used)
            .map(|entry| (entry.package, entry.last_time_used))
    }
}

impl ForegroundDetector for UsageStatsDetector {
    fn backend(&self) -> BackendChoice {
        BackendChoice::UsageStats
    }

    fn is_available(&self) -> bool {
        self.poller.source.has_permission()
    }

    fn start(&self, sink: DetectorSink) -> Result<()> {
        let mut worker = self.worker();
        if let Some(existing) = worker.take() {
            if self.is_running() {
                *worker = Some(existing);
                return Err(AppLockError::AlreadyRunning {
                    backend: self.backend(),
                });
            }
            // The previous thread exited on its own after a failure.
            let _ = existing.handle.join();
        }
        if !self.poller.source.has_permission() {
            return Err(AppLockError::PermissionUnavailable {
                backend: self.backend(),
            });
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = self.poller.config.poll_interval();
        let poller = Arc::clone(&self.poller);
        let running = Arc::clone(&self.running);

        running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("applock-usage-poll".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if !poller.source.has_permission() {
                                sink.failed(BackendChoice::UsageStats, "usage access revoked");
                                break;
                            }
                            if let Some(event) = poller.tick() {
                                if !sink.detected(event) {
                                    break;
                                }
                            }
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { stop_tx, handle });
                tracing::info!(
                    backend = %self.backend(),
                    interval_ms = interval.as_millis() as u64,
                    "Detector started"
                );
                Ok(())
            }
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                Err(AppLockError::ThreadSpawn {
                    name: "applock-usage-poll".to_string(),
                    source,
                })
            }
        }
    }

    fn stop(&self) {
        let Some(Worker { stop_tx, handle }) = self.worker().take() else {
            return;
        };
        let _ = stop_tx.send(());
        if handle.join().is_err() {
            tracing::warn!(backend = %self.backend(), "Poll thread panicked");
        }
        self.running.store(false, Ordering::SeqCst);
        *self
            .poller
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        tracing::info!(backend = %self.backend(), "Detector stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for UsageStatsDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
