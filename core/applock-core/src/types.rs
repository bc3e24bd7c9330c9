//! Shared DTOs for detection, decisions and backend selection.
//! Prefer additive changes to keep the Kotlin bindings stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Android package name, e.g. `com.example.mail`.
pub type PackageId = String;

/// Detection strategies the user can pick from in settings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    #[default]
    Accessibility,
    UsageStats,
    ProcessObserver,
}

impl BackendChoice {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Accessibility => "accessibility",
            Self::UsageStats => "usage_stats",
            Self::ProcessObserver => "process_observer",
        }
    }

    /// Parses a persisted backend id, including the legacy upper-case and
    /// `shizuku` spellings. Unknown values fall back to accessibility, which
    /// every install can run.
    pub fn from_id(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "usage_stats" | "usagestats" => Self::UsageStats,
            "process_observer" | "processobserver" | "shizuku" => Self::ProcessObserver,
            _ => Self::Accessibility,
        }
    }
}

impl std::fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Which detector produced a [`DetectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Accessibility,
    UsageStats,
    ProcessObserver,
}

impl DetectionSource {
    pub fn backend(&self) -> BackendChoice {
        match self {
            Self::Accessibility => BackendChoice::Accessibility,
            Self::UsageStats => BackendChoice::UsageStats,
            Self::ProcessObserver => BackendChoice::ProcessObserver,
        }
    }
}

impl From<BackendChoice> for DetectionSource {
    fn from(backend: BackendChoice) -> Self {
        match backend {
            BackendChoice::Accessibility => Self::Accessibility,
            BackendChoice::UsageStats => Self::UsageStats,
            BackendChoice::ProcessObserver => Self::ProcessObserver,
        }
    }
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.backend().id())
    }
}

/// Whether a biometric challenge is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricPhase {
    Idle,
    AuthInProgress,
}

/// A single "this package is in the foreground" observation.
///
/// Produced per detector cycle and consumed immediately by the decision
/// engine. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub package_id: PackageId,
    pub timestamp: DateTime<Utc>,
    pub source: DetectionSource,
    /// Package detected in the previous cycle. Display/diagnostics only.
    #[serde(default)]
    pub triggering_package: Option<PackageId>,
}

impl DetectionEvent {
    pub fn new(
        package_id: impl Into<PackageId>,
        timestamp: DateTime<Utc>,
        source: DetectionSource,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            timestamp,
            source,
            triggering_package: None,
        }
    }

    pub fn with_triggering(mut self, triggering: Option<PackageId>) -> Self {
        self.triggering_package = triggering.filter(|value| !value.is_empty());
        self
    }
}

/// Picks the effective foreground event out of a batch: the latest
/// timestamp wins, and among equal timestamps the later-arriving entry.
pub fn latest_event<T, F>(items: impl IntoIterator<Item = T>, timestamp: F) -> Option<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.into_iter().fold(None, |best, item| match best {
        Some(current) if timestamp(&current) > timestamp(&item) => Some(current),
        _ => Some(item),
    })
}

/// Outcome of a single decision cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "package", rename_all = "snake_case")]
pub enum LockAction {
    Ignore,
    /// Schedule the debounced home-screen clear.
    ClearState,
    ShowOverlay(PackageId),
    RefreshOverlay(PackageId),
    GrantGraceUnlock(PackageId),
}

impl LockAction {
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::Ignore | Self::ClearState => None,
            Self::ShowOverlay(pkg) | Self::RefreshOverlay(pkg) | Self::GrantGraceUnlock(pkg) => {
                Some(pkg)
            }
        }
    }
}

/// A [`LockAction`] plus the state mutations that accompany it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: LockAction,
    /// Package whose temporary unlock this event invalidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidates: Option<PackageId>,
    /// Package whose expired unlock timestamp should be purged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<PackageId>,
}

impl Decision {
    pub fn new(action: LockAction) -> Self {
        Self {
            action,
            invalidates: None,
            expires: None,
        }
    }
}

impl From<LockAction> for Decision {
    fn from(action: LockAction) -> Self {
        Decision::new(action)
    }
}
