//! Accessibility-event detector.
//!
//! The host forwards accessibility events as they arrive on the platform's
//! callback thread. A small state machine tracks whether the recent-apps
//! switcher is open, because the switcher emits window events for apps the
//! user is only previewing.
//!
//! Settings-package events are also handed to the anti-tamper monitor,
//! independently of the foreground flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DetectorMessage, DetectorSink, ForegroundDetector};
use crate::anti_tamper::{AntiTamperMonitor, GlobalAction};
use crate::config::{mentions_home_screen, mentions_recent_apps, EngineConfig};
use crate::error::{AppLockError, Result};
use crate::registry::LockedAppRegistry;
use crate::state::LockState;
use crate::types::{latest_event, BackendChoice, DetectionEvent, DetectionSource, PackageId};

/// Device-side queries the accessibility detector needs.
pub trait AccessibilityPlatform: Send + Sync {
    /// Whether our accessibility service is enabled.
    fn is_service_enabled(&self) -> bool;
    fn is_keyguard_active(&self) -> bool;
    fn input_method_packages(&self) -> HashSet<PackageId>;
    fn default_launcher(&self) -> Option<PackageId>;
    fn is_device_admin_active(&self) -> bool;
    fn perform_global_action(&self, action: GlobalAction) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessibilityEventKind {
    #[default]
    WindowStateChanged,
    WindowContentChanged,
    WindowsChanged,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentChange {
    #[default]
    None,
    PaneAppeared,
    PaneDisappeared,
}

/// The parts of a platform accessibility event the detector looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityEvent {
    #[serde(default)]
    pub kind: AccessibilityEventKind,
    pub package: Option<PackageId>,
    #[serde(default)]
    pub class_name: Option<String>,
    /// Event text plus any window text the host flattened in.
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub content_change: ContentChange,
    pub timestamp: DateTime<Utc>,
}

impl AccessibilityEvent {
    pub fn window_state(package: impl Into<PackageId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: AccessibilityEventKind::WindowStateChanged,
            package: Some(package.into()),
            class_name: None,
            text: Vec::new(),
            content_change: ContentChange::None,
            timestamp,
        }
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text.push(text.into());
        self
    }

    pub fn with_kind(mut self, kind: AccessibilityEventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_content_change(mut self, change: ContentChange) -> Self {
        self.kind = AccessibilityEventKind::WindowContentChanged;
        self.content_change = change;
        self
    }

    pub fn joined_text(&self) -> String {
        self.text.join(" ")
    }
}

#[derive(Debug, Default)]
struct RecentsTracker {
    recents_open: bool,
    last_package: Option<PackageId>,
}

pub struct AccessibilityDetector {
    platform: Arc<dyn AccessibilityPlatform>,
    registry: Arc<dyn LockedAppRegistry>,
    state: Arc<LockState>,
    config: Arc<EngineConfig>,
    anti_tamper: AntiTamperMonitor,
    tracker: Mutex<RecentsTracker>,
    sink: Mutex<Option<DetectorSink>>,
    running: AtomicBool,
}

impl AccessibilityDetector {
    pub fn new(
        platform: Arc<dyn AccessibilityPlatform>,
        registry: Arc<dyn LockedAppRegistry>,
        state: Arc<LockState>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let anti_tamper = AntiTamperMonitor::new(
            Arc::clone(&platform),
            Arc::clone(&registry),
            Arc::clone(&config),
        );
        Self {
            platform,
            registry,
            state,
            config,
            anti_tamper,
            tracker: Mutex::new(RecentsTracker::default()),
            sink: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_recents_open(&self) -> bool {
        self.tracker().recents_open
    }

    /// Handles one platform event.
    pub fn on_event(&self, event: &AccessibilityEvent) {
        self.on_events(std::slice::from_ref(event));
    }

    /// Handles a batch delivered together. Only the latest candidate is
    /// emitted; the state machine still sees every event in order.
    ///
    /// Settings events reach the anti-tamper monitor even while the detector
    /// is stopped; foreground candidates are only produced while running.
    pub fn on_events(&self, events: &[AccessibilityEvent]) {
        for event in events {
            if event.package.as_deref() == Some(self.config.settings_package.as_str()) {
                self.anti_tamper.inspect(event);
            }
        }

        if !self.is_running() {
            return;
        }

        let mut candidates = Vec::new();
        {
            let mut tracker = self.tracker();
            for event in events {
                if let Some(candidate) = self.evaluate(event, &mut tracker) {
                    candidates.push(candidate);
                }
            }
        }

        let Some(winner) = latest_event(candidates, |candidate| candidate.timestamp) else {
            return;
        };

        let winner = winner.with_triggering(self.tracker().last_package.clone());
        self.tracker().last_package = Some(winner.package_id.clone());

        if let Some(sink) = self.sink() {
            sink.detected(winner);
        }
    }

    fn evaluate(
        &self,
        event: &AccessibilityEvent,
        tracker: &mut RecentsTracker,
    ) -> Option<DetectionEvent> {
        let package = event.package.as_deref().filter(|pkg| !pkg.is_empty())?;
        let launcher = self.is_launcher(package);
        let text = event.joined_text();
        let class_name = event.class_name.as_deref().unwrap_or_default();

        let entering_recents = (launcher && event.content_change == ContentChange::PaneAppeared)
            || mentions_recent_apps(&text)
            || self.config.is_recents_class(class_name);
        if entering_recents {
            if !tracker.recents_open {
                tracing::debug!(package, "Recents opened");
            }
            tracker.recents_open = true;
            return None;
        }

        // Home-screen text counts only from the launcher's own windows.
        let going_home = launcher
            && (event.content_change == ContentChange::PaneDisappeared
                || mentions_home_screen(&text));
        if going_home {
            tracker.recents_open = false;
            return Some(DetectionEvent::new(
                package,
                event.timestamp,
                DetectionSource::Accessibility,
            ));
        }

        if tracker.recents_open {
            let inputs = self.platform.input_method_packages();
            if launcher || self.config.should_skip(package, &inputs) {
                return None;
            }
            tracker.recents_open = false;
            self.leave_recents(package);
        }

        if event.kind != AccessibilityEventKind::WindowStateChanged {
            return None;
        }

        if self.platform.is_keyguard_active() {
            self.state.clear_unlock_timestamps();
            return None;
        }

        let inputs = self.platform.input_method_packages();
        if self.config.should_skip(package, &inputs) {
            return None;
        }

        Some(DetectionEvent::new(
            package,
            event.timestamp,
            DetectionSource::Accessibility,
        ))
    }

    /// Switching apps from the recents screen counts as leaving the
    /// temporarily unlocked app unless the target is trigger-excluded.
    fn leave_recents(&self, package: &str) {
        let Some(unlocked) = self.state.temporarily_unlocked_package() else {
            return;
        };
        if unlocked != package && !self.registry.is_trigger_excluded(package) {
            self.state.clear_temporarily_unlocked_if(&unlocked);
            tracing::debug!(previous = %unlocked, package, "Left recents into another app");
        }
    }

    fn is_launcher(&self, package: &str) -> bool {
        self.config.is_launcher(package)
            || self.platform.default_launcher().as_deref() == Some(package)
    }

    fn tracker(&self) -> MutexGuard<'_, RecentsTracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sink(&self) -> Option<DetectorSink> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ForegroundDetector for AccessibilityDetector {
    fn backend(&self) -> BackendChoice {
        BackendChoice::Accessibility
    }

    fn is_available(&self) -> bool {
        self.platform.is_service_enabled()
    }

    fn start(&self, sink: DetectorSink) -> Result<()> {
        if self.is_running() {
            return Err(AppLockError::AlreadyRunning {
                backend: self.backend(),
            });
        }
        if !self.platform.is_service_enabled() {
            return Err(AppLockError::PermissionUnavailable {
                backend: self.backend(),
            });
        }

        if let Some(launcher) = self.platform.default_launcher() {
            sink.send(DetectorMessage::LauncherResolved(launcher));
        }

        *self.tracker() = RecentsTracker::default();
        *self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(backend = %self.backend(), "Detector started");
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(backend = %self.backend(), "Detector stopped");
        }
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
