//! Backend selection and failover.
//!
//! The user's chosen backend is started first. When it cannot start, or
//! reports a failure while running, exactly one fallback is started by fixed
//! precedence:
//!
//! ```text
//! process_observer -> usage_stats -> accessibility
//! usage_stats      -> accessibility
//! accessibility    -> (none, it is the universal fallback)
//! ```
//!
//! The accessibility detector also runs beside whichever backend is active
//! while its service is enabled. Only the active backend's detections are
//! evaluated.
//!
//! Fallback attempts per failed backend are throttled: attempts closer than
//! the minimum interval are skipped, and after the maximum number of
//! attempts a cooldown applies before the counter resets.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::config::RestartPolicy;
use crate::detectors::{DetectorSink, ForegroundDetector};
use crate::error::{AppLockError, Result};
use crate::registry::LockedAppRegistry;
use crate::types::{BackendChoice, DetectionSource};

/// Backends to try, in order, after `failed` stops working.
pub fn fallback_order(failed: BackendChoice) -> &'static [BackendChoice] {
    match failed {
        BackendChoice::ProcessObserver => {
            &[BackendChoice::UsageStats, BackendChoice::Accessibility]
        }
        BackendChoice::UsageStats => &[BackendChoice::Accessibility],
        BackendChoice::Accessibility => &[],
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RestartRecord {
    attempts: u32,
    last: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct FailoverState {
    active: Option<BackendChoice>,
    restarts: HashMap<BackendChoice, RestartRecord>,
}

pub struct FailoverController {
    detectors: HashMap<BackendChoice, Arc<dyn ForegroundDetector>>,
    registry: Arc<dyn LockedAppRegistry>,
    policy: RestartPolicy,
    clock: Arc<dyn Clock>,
    sink: DetectorSink,
    state: Mutex<FailoverState>,
}

impl FailoverController {
    pub fn new(
        registry: Arc<dyn LockedAppRegistry>,
        policy: RestartPolicy,
        clock: Arc<dyn Clock>,
        sink: DetectorSink,
    ) -> Self {
        Self {
            detectors: HashMap::new(),
            registry,
            policy,
            clock,
            sink,
            state: Mutex::new(FailoverState::default()),
        }
    }

    /// Installs the detector for its backend, replacing any previous one.
    pub fn with_detector(mut self, detector: Arc<dyn ForegroundDetector>) -> Self {
        self.detectors.insert(detector.backend(), detector);
        self
    }

    pub fn detector(&self, backend: BackendChoice) -> Option<&Arc<dyn ForegroundDetector>> {
        self.detectors.get(&backend)
    }

    pub fn active_backend(&self) -> Option<BackendChoice> {
        self.lock().active
    }

    pub fn is_running(&self, backend: BackendChoice) -> bool {
        self.detectors
            .get(&backend)
            .is_some_and(|detector| detector.is_running())
    }

    /// Starts the chosen backend, falling back if it cannot run. The
    /// accessibility detector is started alongside whenever the service is
    /// enabled, since anti-tamper rides on it.
    pub fn start(&self) -> Result<BackendChoice> {
        let result = self.start_chosen();
        self.keep_accessibility_running();
        result
    }

    fn start_chosen(&self) -> Result<BackendChoice> {
        let mut state = self.lock();
        let chosen = self.registry.chosen_backend();

        match self.start_backend(chosen) {
            Ok(()) => {
                state.active = Some(chosen);
                state.restarts.remove(&chosen);
                tracing::info!(backend = %chosen, "Primary backend active");
                Ok(chosen)
            }
            Err(err) => {
                tracing::warn!(backend = %chosen, error = %err, "Primary backend failed to start");
                self.fail_over(&mut state, chosen)
            }
        }
    }

    /// Called when a running backend reports that it died.
    pub fn on_backend_failed(&self, backend: BackendChoice, reason: &str) -> Result<BackendChoice> {
        let mut state = self.lock();
        tracing::warn!(backend = %backend, reason, "Backend failed");

        if let Some(detector) = self.detectors.get(&backend) {
            detector.stop();
        }

        if let Some(active) = state.active.filter(|active| *active != backend) {
            if self.is_running(active) {
                tracing::debug!(active = %active, "Failed backend was not active; keeping current");
                return Ok(active);
            }
        }

        self.fail_over(&mut state, backend)
    }

    /// Re-checks the active backend and replaces it if it is no longer
    /// usable: the chosen backend first, then the preferred fallback, then
    /// the fallback chain.
    pub fn revalidate(&self) -> Result<BackendChoice> {
        let result = self.revalidate_active();
        self.keep_accessibility_running();
        result
    }

    fn revalidate_active(&self) -> Result<BackendChoice> {
        let mut state = self.lock();
        let chosen = self.registry.chosen_backend();
        let preferred = self.registry.fallback_backend();

        let Some(active) = state.active else {
            drop(state);
            return self.start_chosen();
        };

        let healthy = self
            .detectors
            .get(&active)
            .is_some_and(|detector| detector.is_available() && detector.is_running());
        if healthy {
            return Ok(active);
        }

        tracing::warn!(backend = %active, "Active backend no longer available");
        if let Some(detector) = self.detectors.get(&active) {
            detector.stop();
        }
        state.active = None;

        for candidate in [chosen, preferred] {
            if candidate == active {
                continue;
            }
            let usable = self
                .detectors
                .get(&candidate)
                .is_some_and(|detector| detector.is_available());
            if usable && self.start_backend(candidate).is_ok() {
                state.active = Some(candidate);
                state.restarts.remove(&candidate);
                tracing::info!(backend = %candidate, "Revalidated backend active");
                return Ok(candidate);
            }
        }

        self.fail_over(&mut state, active)
    }

    /// Stops every detector; failover state is kept.
    pub fn stop_all(&self) {
        let mut state = self.lock();
        for detector in self.detectors.values() {
            detector.stop();
        }
        state.active = None;
    }

    /// Only the active backend's events are evaluated. With no active
    /// backend, or one that has stopped, every source is.
    pub fn should_evaluate(&self, source: DetectionSource) -> bool {
        match self.lock().active {
            Some(active) if self.is_running(active) => source.backend() == active,
            _ => true,
        }
    }

    fn keep_accessibility_running(&self) {
        let Some(detector) = self.detectors.get(&BackendChoice::Accessibility) else {
            return;
        };
        if detector.is_running() || !detector.is_available() {
            return;
        }
        match detector.start(self.sink.clone()) {
            Ok(()) => tracing::debug!("Accessibility detector running alongside active backend"),
            Err(err) => tracing::debug!(error = %err, "Accessibility detector not started"),
        }
    }

    fn fail_over(&self, state: &mut FailoverState, failed: BackendChoice) -> Result<BackendChoice> {
        if state.active == Some(failed) {
            state.active = None;
        }

        let now = self.clock.now();
        if !self.should_attempt_restart(state, failed, now) {
            return Err(AppLockError::NoFallbackAvailable(failed));
        }

        let mut attempted = false;
        let mut started = None;
        for candidate in fallback_order(failed).iter().copied() {
            if self.is_running(candidate) {
                started = Some(candidate);
                break;
            }
            attempted = true;
            match self.start_backend(candidate) {
                Ok(()) => {
                    started = Some(candidate);
                    break;
                }
                Err(err) => {
                    tracing::warn!(backend = %candidate, error = %err, "Fallback backend failed to start");
                }
            }
        }

        if attempted {
            let record = state.restarts.entry(failed).or_default();
            record.attempts += 1;
            record.last = Some(now);
            tracing::debug!(failed = %failed, attempts = record.attempts, "Recorded fallback attempt");
        }

        match started {
            Some(backend) => {
                state.active = Some(backend);
                tracing::info!(failed = %failed, backend = %backend, "Fallback backend active");
                Ok(backend)
            }
            None => {
                tracing::error!(failed = %failed, "No fallback backend available");
                Err(AppLockError::NoFallbackAvailable(failed))
            }
        }
    }

    fn should_attempt_restart(
        &self,
        state: &mut FailoverState,
        failed: BackendChoice,
        now: DateTime<Utc>,
    ) -> bool {
        let record = state.restarts.entry(failed).or_default();
        let Some(last) = record.last else {
            return true;
        };
        let since_last = now.signed_duration_since(last);

        if since_last < Duration::milliseconds(self.policy.min_interval_ms as i64) {
            tracing::debug!(failed = %failed, "Fallback attempt too recent; skipping");
            return false;
        }

        if record.attempts >= self.policy.max_attempts {
            if since_last > Duration::milliseconds(self.policy.cooldown_ms as i64) {
                tracing::debug!(failed = %failed, "Fallback cooldown expired; resetting attempts");
                record.attempts = 0;
                return true;
            }
            tracing::debug!(failed = %failed, "Fallback attempts exhausted; in cooldown");
            return false;
        }

        true
    }

    /// Starting a detector that is already running is a no-op.
    fn start_backend(&self, backend: BackendChoice) -> Result<()> {
        let detector = self
            .detectors
            .get(&backend)
            .ok_or(AppLockError::DetectorMissing(backend))?;
        match detector.start(self.sink.clone()) {
            Ok(()) | Err(AppLockError::AlreadyRunning { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
