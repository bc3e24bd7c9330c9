//! AppLockCore - the Kotlin-facing entry point.
//!
//! The host keeps its own accessibility service, usage poller and
//! privileged-channel plumbing, and forwards each resolved foreground app
//! here. The returned [`LockActionFfi`] tells it what to do with the
//! overlay. Authentication results come back through the callback methods.
//!
//! Prefer additive changes; renaming or removing anything here breaks the
//! generated Kotlin bindings.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::clock::SystemClock;
use crate::config::{load_engine_config_or_default, EngineConfig};
use crate::engine::LockEngine;
use crate::error::{AppLockError, AppLockFfiError};
use crate::failover::fallback_order;
use crate::overlay::OverlayPresenter;
use crate::registry::{MemoryRegistry, RegistryData};
use crate::scheduler::ThreadScheduler;
use crate::state::LockState;
use crate::types::{
    BackendChoice, BiometricPhase, DetectionEvent, DetectionSource, LockAction, PackageId,
};

/// User settings pushed from the host's preference store.
#[derive(Debug, Clone, uniffi::Record)]
pub struct AppLockSettings {
    pub locked_apps: Vec<String>,
    pub trigger_excluded_apps: Vec<String>,
    pub credential: Option<String>,
    pub biometric_enabled: bool,
    pub anti_uninstall_enabled: bool,
    pub unlock_grace_minutes: u32,
    pub chosen_backend: BackendChoice,
    /// Tried after the chosen backend when the active one is revalidated.
    pub fallback_backend: BackendChoice,
    pub protect_enabled: bool,
    /// Extra home apps beyond the built-in list (e.g. the resolved default).
    pub launcher_packages: Vec<String>,
}

impl AppLockSettings {
    fn to_registry_data(&self) -> Result<RegistryData, AppLockError> {
        Ok(RegistryData {
            locked_apps: collect_packages(&self.locked_apps)?,
            trigger_excluded_apps: collect_packages(&self.trigger_excluded_apps)?,
            credential: self.credential.clone(),
            biometric_enabled: self.biometric_enabled,
            anti_uninstall_enabled: self.anti_uninstall_enabled,
            unlock_grace_minutes: self.unlock_grace_minutes,
            chosen_backend: self.chosen_backend,
            fallback_backend: self.fallback_backend,
            protect_enabled: self.protect_enabled,
        })
    }
}

fn collect_packages(packages: &[String]) -> Result<BTreeSet<PackageId>, AppLockError> {
    packages
        .iter()
        .map(|pkg| {
            let trimmed = pkg.trim();
            if trimmed.is_empty() {
                Err(AppLockError::BlankPackage)
            } else {
                Ok(trimmed.to_string())
            }
        })
        .collect()
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct DetectionEventFfi {
    pub package_id: String,
    pub timestamp_millis: i64,
    pub source: DetectionSource,
    pub triggering_package: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum LockActionFfi {
    Ignore,
    ClearState,
    ShowOverlay { package: String },
    RefreshOverlay { package: String },
    GrantGraceUnlock { package: String },
}

impl From<LockAction> for LockActionFfi {
    fn from(action: LockAction) -> Self {
        match action {
            LockAction::Ignore => Self::Ignore,
            LockAction::ClearState => Self::ClearState,
            LockAction::ShowOverlay(package) => Self::ShowOverlay { package },
            LockAction::RefreshOverlay(package) => Self::RefreshOverlay { package },
            LockAction::GrantGraceUnlock(package) => Self::GrantGraceUnlock { package },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct UnlockRecordFfi {
    pub package: String,
    pub unlocked_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct LockStateSnapshotFfi {
    pub temporarily_unlocked_package: Option<String>,
    pub unlocks: Vec<UnlockRecordFfi>,
    pub biometric_phase: BiometricPhase,
    pub overlay_visible: bool,
    pub overlay_package: Option<String>,
}

/// The host draws the overlay itself after reading the returned action, so
/// presenter calls always succeed here. Launch failures are reported back
/// through [`AppLockCore::overlay_launch_failed`].
struct HostPresenter;

impl OverlayPresenter for HostPresenter {
    fn show_overlay(&self, _package: &str, _triggering: Option<&str>) -> crate::Result<()> {
        Ok(())
    }

    fn refresh_overlay(&self, _package: &str) -> crate::Result<()> {
        Ok(())
    }
}

#[derive(uniffi::Object)]
pub struct AppLockCore {
    engine: LockEngine,
    registry: Arc<MemoryRegistry>,
}

impl AppLockCore {
    /// Builds a core with an explicit engine config. Not exposed to FFI.
    pub fn with_config(
        settings: AppLockSettings,
        config: EngineConfig,
    ) -> Result<Self, AppLockFfiError> {
        let registry = Arc::new(MemoryRegistry::from_data(settings.to_registry_data()?));
        let engine = LockEngine::new(
            Arc::new(LockState::new()),
            registry.clone(),
            Arc::new(HostPresenter),
            Arc::new(ThreadScheduler),
            Arc::new(SystemClock),
            Arc::new(config),
        );
        for launcher in &settings.launcher_packages {
            engine.add_launcher(launcher);
        }
        Ok(Self { engine, registry })
    }

    pub fn engine(&self) -> &LockEngine {
        &self.engine
    }
}

#[uniffi::export]
impl AppLockCore {
    #[uniffi::constructor]
    pub fn new(settings: AppLockSettings) -> Result<Self, AppLockFfiError> {
        Self::with_config(settings, EngineConfig::default())
    }

    /// Like `new`, but reads platform constants and timing from a JSON
    /// file. A missing or malformed file falls back to defaults.
    #[uniffi::constructor]
    pub fn with_config_file(
        settings: AppLockSettings,
        config_path: String,
    ) -> Result<Self, AppLockFfiError> {
        let config = load_engine_config_or_default(Path::new(&config_path));
        Self::with_config(settings, config)
    }

    pub fn update_registry(&self, settings: AppLockSettings) -> Result<(), AppLockFfiError> {
        self.registry.replace(settings.to_registry_data()?);
        for launcher in &settings.launcher_packages {
            self.engine.add_launcher(launcher);
        }
        Ok(())
    }

    pub fn process_detection(
        &self,
        event: DetectionEventFfi,
    ) -> Result<LockActionFfi, AppLockFfiError> {
        if event.package_id.trim().is_empty() {
            return Err(AppLockError::BlankPackage.into());
        }
        let timestamp = millis_to_datetime(event.timestamp_millis)?;
        let event = DetectionEvent::new(event.package_id, timestamp, event.source)
            .with_triggering(event.triggering_package);
        Ok(self.engine.process(&event).action.into())
    }

    pub fn credential_accepted(&self, package: String) {
        self.engine.on_credential_accepted(&package);
    }

    pub fn submit_credential(&self, package: String, secret: String) -> bool {
        self.engine.submit_credential(&package, &secret)
    }

    pub fn biometric_started(&self) {
        self.engine.on_biometric_started();
    }

    /// Returns the package unlocked by a successful prompt.
    pub fn biometric_finished(&self, success: bool) -> Option<String> {
        self.engine.on_biometric_finished(success)
    }

    pub fn overlay_dismissed(&self) {
        self.engine.on_dismissed();
    }

    /// The host could not launch the overlay it was told to show.
    pub fn overlay_launch_failed(&self) {
        if let Some(package) = self.engine.state().mark_overlay_hidden() {
            tracing::warn!(package = %package, "Host reported overlay launch failure");
        }
    }

    pub fn app_unprotected(&self, package: String) {
        self.engine.on_app_unprotected(&package);
    }

    pub fn state_snapshot(&self) -> LockStateSnapshotFfi {
        let snapshot = self.engine.state().snapshot();
        let mut unlocks: Vec<UnlockRecordFfi> = snapshot
            .unlock_timestamps
            .into_iter()
            .map(|(package, at)| UnlockRecordFfi {
                package,
                unlocked_at_millis: at.timestamp_millis(),
            })
            .collect();
        unlocks.sort_by(|a, b| a.package.cmp(&b.package));

        LockStateSnapshotFfi {
            temporarily_unlocked_package: snapshot.temporarily_unlocked_package,
            unlocks,
            biometric_phase: snapshot.biometric_phase,
            overlay_visible: snapshot.overlay_visible,
            overlay_package: snapshot.overlay_package,
        }
    }
}

/// Fallback backends for `failed`, in the order the host should try them.
#[uniffi::export]
pub fn fallback_backends(failed: BackendChoice) -> Vec<BackendChoice> {
    fallback_order(failed).to_vec()
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, AppLockFfiError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AppLockFfiError::from(format!("Invalid timestamp: {millis}")))
}
