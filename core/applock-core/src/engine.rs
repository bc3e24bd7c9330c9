//! Lock decision engine.
//!
//! [`decide`] is a pure function of the event, the lock state and the
//! registry: it never mutates anything. [`LockEngine`] owns the
//! collaborators and applies a [`Decision`] (state mutations plus overlay
//! commands), and it is where the overlay reports authentication results.
//!
//! Decision order, first match wins:
//!
//! 1. launcher package: schedule the debounced home-screen clear
//! 2. biometric prompt in progress: ignore
//! 3. overlay already up for this package: refresh it
//! 4. package is the temporarily unlocked one: ignore
//! 5. a different, non-excluded package invalidates the temporary unlock;
//!    unlocked packages are then ignored
//! 6. inside the grace window: grant a grace unlock, otherwise purge the
//!    stale timestamp and show the overlay

use chrono::Duration;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::overlay::OverlayPresenter;
use crate::registry::LockedAppRegistry;
use crate::scheduler::Scheduler;
use crate::state::LockState;
use crate::types::{BiometricPhase, Decision, DetectionEvent, LockAction, PackageId};

/// What [`decide`] is allowed to read besides the state.
pub struct RegistryView<'a> {
    pub registry: &'a dyn LockedAppRegistry,
    pub launchers: &'a BTreeSet<PackageId>,
}

impl<'a> RegistryView<'a> {
    pub fn new(registry: &'a dyn LockedAppRegistry, launchers: &'a BTreeSet<PackageId>) -> Self {
        Self {
            registry,
            launchers,
        }
    }

    fn is_launcher(&self, package: &str) -> bool {
        self.launchers.contains(package)
    }
}

pub fn decide(event: &DetectionEvent, state: &LockState, view: &RegistryView<'_>) -> Decision {
    let package = event.package_id.as_str();

    if view.is_launcher(package) {
        return LockAction::ClearState.into();
    }

    if state.biometric_phase() == BiometricPhase::AuthInProgress {
        return LockAction::Ignore.into();
    }

    if state.overlay_visible() && state.overlay_package().as_deref() == Some(package) {
        return LockAction::RefreshOverlay(package.to_string()).into();
    }

    let unlocked = state.temporarily_unlocked_package();
    if unlocked.as_deref() == Some(package) {
        return LockAction::Ignore.into();
    }

    let invalidates = unlocked.filter(|_| !view.registry.is_trigger_excluded(package));

    if !view.registry.is_locked(package) {
        return Decision {
            action: LockAction::Ignore,
            invalidates,
            expires: None,
        };
    }

    let grace_minutes = view.registry.unlock_grace_minutes();
    let unlocked_at = state.unlock_timestamp(package);

    if grace_minutes > 0 {
        if let Some(unlocked_at) = unlocked_at {
            let elapsed = event.timestamp.signed_duration_since(unlocked_at);
            if elapsed < Duration::minutes(i64::from(grace_minutes)) {
                return Decision {
                    action: LockAction::GrantGraceUnlock(package.to_string()),
                    invalidates,
                    expires: None,
                };
            }
        }
    }

    Decision {
        action: LockAction::ShowOverlay(package.to_string()),
        invalidates,
        expires: unlocked_at.map(|_| package.to_string()),
    }
}

/// Applies decisions and receives authentication results from the overlay.
pub struct LockEngine {
    state: Arc<LockState>,
    registry: Arc<dyn LockedAppRegistry>,
    presenter: Arc<dyn OverlayPresenter>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    launchers: RwLock<BTreeSet<PackageId>>,
}

impl LockEngine {
    pub fn new(
        state: Arc<LockState>,
        registry: Arc<dyn LockedAppRegistry>,
        presenter: Arc<dyn OverlayPresenter>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let launchers = config.launcher_packages.iter().cloned().collect();
        Self {
            state,
            registry,
            presenter,
            scheduler,
            clock,
            config,
            launchers: RwLock::new(launchers),
        }
    }

    pub fn state(&self) -> &Arc<LockState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<dyn LockedAppRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Adds a launcher the platform reported as the default home app.
    pub fn add_launcher(&self, package: &str) {
        if package.trim().is_empty() {
            return;
        }
        let mut launchers = self
            .launchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if launchers.insert(package.to_string()) {
            tracing::debug!(package, "Registered launcher package");
        }
    }

    pub fn is_launcher(&self, package: &str) -> bool {
        self.launchers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(package)
    }

    /// Runs one decision cycle for `event` and applies the result.
    pub fn process(&self, event: &DetectionEvent) -> Decision {
        let generation = self.state.advance_generation();
        let decision = {
            let launchers = self
                .launchers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let view = RegistryView::new(self.registry.as_ref(), &launchers);
            decide(event, &self.state, &view)
        };

        tracing::debug!(
            package = %event.package_id,
            source = %event.source,
            generation,
            action = ?decision.action,
            "Decision"
        );

        self.apply(event, &decision, generation);
        decision
    }

    fn apply(&self, event: &DetectionEvent, decision: &Decision, generation: u64) {
        if let Some(previous) = decision.invalidates.as_deref() {
            if self.state.clear_temporarily_unlocked_if(previous) {
                tracing::debug!(
                    previous,
                    package = %event.package_id,
                    "Temporary unlock invalidated by app switch"
                );
            }
        }

        if let Some(expired) = decision.expires.as_deref() {
            self.state.remove_unlock_timestamp(expired);
        }

        match &decision.action {
            LockAction::Ignore => {}
            LockAction::ClearState => self.schedule_home_clear(generation),
            LockAction::ShowOverlay(package) => {
                self.state.mark_overlay_shown(package);
                if let Err(err) = self
                    .presenter
                    .show_overlay(package, event.triggering_package.as_deref())
                {
                    tracing::warn!(error = %err, package = %package, "Overlay launch failed");
                    self.state.mark_overlay_hidden();
                }
            }
            LockAction::RefreshOverlay(package) => {
                if let Err(err) = self.presenter.refresh_overlay(package) {
                    tracing::warn!(error = %err, package = %package, "Overlay refresh failed");
                }
            }
            LockAction::GrantGraceUnlock(package) => {
                tracing::info!(package = %package, "Within unlock grace window");
                self.state.set_temporarily_unlocked(package);
            }
        }
    }

    /// Clears the temporary unlock once the launcher has stayed in front for
    /// the debounce period. Any later detection event bumps the generation
    /// and turns this into a no-op.
    fn schedule_home_clear(&self, generation: u64) {
        let state = Arc::clone(&self.state);
        self.scheduler.schedule(
            self.config.home_debounce(),
            Box::new(move || {
                if state.generation() != generation {
                    return;
                }
                if let Some(package) = state.clear_temporarily_unlocked() {
                    tracing::debug!(package = %package, "Cleared temporary unlock after home screen");
                }
            }),
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Overlay callbacks
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_credential_accepted(&self, package: &str) {
        let now = self.clock.now();
        self.state.unlock(package, now);
        self.state.set_biometric_phase(BiometricPhase::Idle);
        self.state.mark_overlay_hidden();
        tracing::info!(package, "App unlocked");
    }

    /// Validates `secret` through the registry and unlocks on success.
    pub fn submit_credential(&self, package: &str, secret: &str) -> bool {
        if !self.registry.validate_credential(secret) {
            tracing::info!(package, "Credential rejected");
            return false;
        }
        self.on_credential_accepted(package);
        true
    }

    pub fn on_biometric_started(&self) {
        if !self.registry.is_biometric_enabled() {
            tracing::warn!("Biometric prompt started while biometrics are disabled");
        }
        self.state.set_biometric_phase(BiometricPhase::AuthInProgress);
    }

    /// Returns the package that was unlocked, if any.
    pub fn on_biometric_finished(&self, success: bool) -> Option<PackageId> {
        self.state.set_biometric_phase(BiometricPhase::Idle);
        if !success {
            return None;
        }

        match self.state.overlay_package() {
            Some(package) => {
                self.on_credential_accepted(&package);
                Some(package)
            }
            None => {
                tracing::warn!("Biometric success with no overlay package");
                None
            }
        }
    }

    /// The overlay closed without authenticating (back/home from the lock
    /// screen).
    pub fn on_dismissed(&self) {
        self.state.set_biometric_phase(BiometricPhase::Idle);
        if let Some(package) = self.state.mark_overlay_hidden() {
            tracing::debug!(package = %package, "Overlay dismissed");
        }
    }

    /// The user removed `package` from the locked set.
    pub fn on_app_unprotected(&self, package: &str) {
        self.state.remove_unlock_timestamp(package);
        self.state.clear_temporarily_unlocked_if(package);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::overlay::{OverlayCommand, RecordingPresenter};
    use crate::registry::MemoryRegistry;
    use crate::scheduler::ManualScheduler;
    use crate::types::DetectionSource;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid timestamp")
    }

    fn event(package: &str, ms: i64) -> DetectionEvent {
        DetectionEvent::new(package, at(ms), DetectionSource::UsageStats)
    }

    fn launchers() -> BTreeSet<PackageId> {
        ["com.android.launcher3".to_string()].into_iter().collect()
    }

    fn registry_with(locked: &[&str]) -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        for package in locked {
            registry.lock_app(package).unwrap();
        }
        registry
    }

    #[test]
    fn launcher_always_clears() {
        let registry = registry_with(&["com.android.launcher3"]);
        let state = LockState::new();
        state.set_biometric_phase(BiometricPhase::AuthInProgress);
        let launchers = launchers();
        let view = RegistryView::new(&registry, &launchers);

        let decision = decide(&event("com.android.launcher3", 0), &state, &view);
        assert_eq!(decision.action, LockAction::ClearState);
    }

    #[test]
    fn biometric_in_progress_ignores_locked_app() {
        let registry = registry_with(&["com.locked"]);
        let state = LockState::new();
        state.set_biometric_phase(BiometricPhase::AuthInProgress);
        let launchers = launchers();
        let view = RegistryView::new(&registry, &launchers);

        assert_eq!(
            decide(&event("com.locked", 0), &state, &view),
            Decision::new(LockAction::Ignore)
        );
    }

    #[test]
    fn visible_overlay_for_same_package_refreshes() {
        let registry = registry_with(&["com.locked"]);
        let state = LockState::new();
        state.mark_overlay_shown("com.locked");
        let launchers = launchers();
        let view = RegistryView::new(&registry, &launchers);

        assert_eq!(
            decide(&event("com.locked", 0), &state, &view).action,
            LockAction::RefreshOverlay("com.locked".to_string())
        );
    }

    #[test]
    fn trigger_excluded_package_keeps_temporary_unlock() {
        let registry = registry_with(&["com.locked"]);
        registry.add_trigger_exclusion("com.camera").unwrap();
        let state = LockState::new();
        state.set_temporarily_unlocked("com.locked");
        let launchers = launchers();
        let view = RegistryView::new(&registry, &launchers);

        let decision = decide(&event("com.camera", 0), &state, &view);
        assert_eq!(decision.action, LockAction::Ignore);
        assert!(decision.invalidates.is_none());

        let decision = decide(&event("com.browser", 0), &state, &view);
        assert_eq!(decision.invalidates.as_deref(), Some("com.locked"));
    }

    #[test]
    fn zero_grace_always_shows_and_purges_timestamp() {
        let registry = registry_with(&["com.locked"]);
        let state = LockState::new();
        state.record_unlock("com.locked", at(0));
        let launchers = launchers();
        let view = RegistryView::new(&registry, &launchers);

        let decision = decide(&event("com.locked", 1_000), &state, &view);
        assert_eq!(decision.action, LockAction::ShowOverlay("com.locked".to_string()));
        assert_eq!(decision.expires.as_deref(), Some("com.locked"));
    }

    fn engine_with(
        registry: MemoryRegistry,
    ) -> (LockEngine, Arc<RecordingPresenter>, Arc<ManualScheduler>) {
        let presenter = Arc::new(RecordingPresenter::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let engine = LockEngine::new(
            Arc::new(LockState::new()),
            Arc::new(registry),
            presenter.clone(),
            scheduler.clone(),
            Arc::new(ManualClock::new(at(0))),
            Arc::new(EngineConfig::default()),
        );
        (engine, presenter, scheduler)
    }

    #[test]
    fn failed_overlay_launch_resets_visibility() {
        let (engine, presenter, _) = engine_with(registry_with(&["com.locked"]));
        presenter.set_reject_shows(true);

        let decision = engine.process(&event("com.locked", 0));
        assert_eq!(decision.action, LockAction::ShowOverlay("com.locked".to_string()));
        assert!(!engine.state().overlay_visible());

        presenter.set_reject_shows(false);
        engine.process(&event("com.locked", 10));
        assert!(engine.state().overlay_visible());
        assert_eq!(presenter.show_count(), 1);
    }

    #[test]
    fn show_carries_triggering_package() {
        let (engine, presenter, _) = engine_with(registry_with(&["com.locked"]));
        let event = event("com.locked", 0).with_triggering(Some("com.previous".to_string()));

        engine.process(&event);
        assert_eq!(
            presenter.commands(),
            vec![OverlayCommand::Show {
                package: "com.locked".to_string(),
                triggering: Some("com.previous".to_string()),
            }]
        );
    }

    #[test]
    fn wrong_credential_keeps_app_locked() {
        let registry = registry_with(&["com.locked"]);
        registry.set_credential("2580");
        let (engine, _, _) = engine_with(registry);
        engine.process(&event("com.locked", 0));

        assert!(!engine.submit_credential("com.locked", "0000"));
        assert!(engine.state().overlay_visible());
        assert!(engine.state().temporarily_unlocked_package().is_none());

        assert!(engine.submit_credential("com.locked", "2580"));
        assert!(!engine.state().overlay_visible());
        assert!(engine.state().is_temporarily_unlocked("com.locked"));
        assert_eq!(engine.state().unlock_timestamp("com.locked"), Some(at(0)));
    }

    #[test]
    fn biometric_success_unlocks_overlay_package() {
        let (engine, _, _) = engine_with(registry_with(&["com.locked"]));
        engine.process(&event("com.locked", 0));
        engine.on_biometric_started();
        assert_eq!(engine.state().biometric_phase(), BiometricPhase::AuthInProgress);

        assert_eq!(engine.on_biometric_finished(true).as_deref(), Some("com.locked"));
        assert_eq!(engine.state().biometric_phase(), BiometricPhase::Idle);
        assert!(engine.state().is_temporarily_unlocked("com.locked"));
    }

    #[test]
    fn biometric_failure_leaves_overlay_up() {
        let (engine, _, _) = engine_with(registry_with(&["com.locked"]));
        engine.process(&event("com.locked", 0));
        engine.on_biometric_started();

        assert!(engine.on_biometric_finished(false).is_none());
        assert!(engine.state().overlay_visible());
        assert!(engine.state().temporarily_unlocked_package().is_none());
    }

    #[test]
    fn dismiss_hides_overlay_without_unlocking() {
        let (engine, _, _) = engine_with(registry_with(&["com.locked"]));
        engine.process(&event("com.locked", 0));
        engine.on_dismissed();

        assert!(!engine.state().overlay_visible());
        assert!(engine.state().temporarily_unlocked_package().is_none());
    }

    #[test]
    fn unprotecting_app_drops_its_unlock() {
        let (engine, _, _) = engine_with(registry_with(&["com.locked"]));
        engine.on_credential_accepted("com.locked");

        engine.on_app_unprotected("com.locked");
        assert!(engine.state().temporarily_unlocked_package().is_none());
        assert!(engine.state().unlock_timestamp("com.locked").is_none());
    }

    #[test]
    fn added_launcher_clears_state() {
        let (engine, _, scheduler) = engine_with(MemoryRegistry::new());
        assert!(!engine.is_launcher("com.custom.home"));
        engine.add_launcher("com.custom.home");

        let decision = engine.process(&event("com.custom.home", 0));
        assert_eq!(decision.action, LockAction::ClearState);
        assert_eq!(scheduler.pending_count(), 1);
    }
}
