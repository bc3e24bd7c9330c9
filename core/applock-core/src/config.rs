//! Engine configuration and on-disk paths.
//!
//! [`EngineConfig`] holds the platform constants the detectors match against
//! (launcher packages, activity classes, app labels) plus the timing knobs.
//! Every field has a default, so a partial or missing `engine.json` still
//! yields a working engine.
//!
//! [`StorageConfig`] is the single place that decides where files live.
//! Production code uses `StorageConfig::default()` (`~/.applock/`); tests use
//! `StorageConfig::with_root(temp_dir)`.

use fs_err as fs;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppLockError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Window text matchers
// ═══════════════════════════════════════════════════════════════════════════════

static RECENTS_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\brecent\s+apps\b").expect("static regex"));
static HOME_SCREEN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bhome\s+screen\b").expect("static regex"));
static DEVICE_ADMIN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdevice\s+admin").expect("static regex"));

/// Window text announcing the recent-apps switcher.
pub fn mentions_recent_apps(text: &str) -> bool {
    RECENTS_TEXT.is_match(text)
}

/// Window text announcing a return to the home screen.
pub fn mentions_home_screen(text: &str) -> bool {
    HOME_SCREEN_TEXT.is_match(text)
}

/// Window text of the device-admin settings pages.
pub fn mentions_device_admin(text: &str) -> bool {
    DEVICE_ADMIN_TEXT.is_match(text)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Throttle for starting fallback detectors after a backend fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub min_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_interval_ms: 5_000,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Our own package. Events from it (and anything prefixed by it) are
    /// never evaluated.
    pub self_package: String,
    pub overlay_activity_class: String,
    /// Fallback launcher list when the platform cannot name the default home
    /// app.
    pub launcher_packages: Vec<String>,
    pub settings_package: String,
    /// Labels our app shows under in system settings.
    pub app_labels: Vec<String>,
    /// System packages that never count as a foreground app.
    pub excluded_packages: Vec<String>,
    pub recents_classes: Vec<String>,
    pub admin_config_classes: Vec<String>,
    pub accessibility_settings_classes: Vec<String>,
    pub home_debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub event_window_ms: u64,
    pub snapshot_window_ms: u64,
    pub restart: RestartPolicy,
}

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 250;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            self_package: "dev.pranav.applock".to_string(),
            overlay_activity_class: "dev.pranav.applock.features.lockscreen.ui.PasswordOverlayActivity"
                .to_string(),
            launcher_packages: strings(&[
                "com.google.android.apps.nexuslauncher",
                "com.android.launcher3",
                "com.sec.android.app.launcher",
            ]),
            settings_package: "com.android.settings".to_string(),
            app_labels: strings(&["App Lock", "AppLock"]),
            excluded_packages: strings(&[
                "com.android.systemui",
                "com.android.intentresolver",
                "com.google.android.permissioncontroller",
                "android.uid.system:1000",
                "com.google.android.googlequicksearchbox",
            ]),
            recents_classes: strings(&[
                "com.android.systemui.recents.RecentsActivity",
                "com.android.quickstep.RecentsActivity",
                "com.android.systemui.recents.RecentsView",
                "com.android.systemui.recents.RecentsPanelView",
            ]),
            admin_config_classes: strings(&[
                "com.android.settings.deviceadmin.DeviceAdminAdd",
                "com.android.settings.applications.specialaccess.deviceadmin.DeviceAdminAdd",
                "com.android.settings.deviceadmin.DeviceAdminSettings",
            ]),
            accessibility_settings_classes: strings(&[
                "com.android.settings.accessibility.AccessibilitySettings",
                "com.android.settings.accessibility.AccessibilityMenuActivity",
                "com.android.settings.accessibility.AccessibilityShortcutActivity",
                "com.android.settings.Settings$AccessibilitySettingsActivity",
            ]),
            home_debounce_ms: 3_000,
            poll_interval_ms: 250,
            event_window_ms: 2_000,
            snapshot_window_ms: 10_000,
            restart: RestartPolicy::default(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl EngineConfig {
    pub fn home_debounce(&self) -> Duration {
        Duration::from_millis(self.home_debounce_ms)
    }

    /// Poll period clamped to the supported 100–250 ms range.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    pub fn event_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.event_window_ms as i64)
    }

    pub fn snapshot_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.snapshot_window_ms as i64)
    }

    pub fn is_launcher(&self, package: &str) -> bool {
        self.launcher_packages.iter().any(|known| known == package)
    }

    pub fn is_excluded(&self, package: &str) -> bool {
        self.excluded_packages.iter().any(|known| known == package)
    }

    /// Our package or one of its sub-processes (`dev.pranav.applock:remote`).
    pub fn is_self(&self, package: &str) -> bool {
        package.starts_with(&self.self_package)
    }

    pub fn is_recents_class(&self, class_name: &str) -> bool {
        self.recents_classes.iter().any(|known| known == class_name)
    }

    pub fn is_admin_config_class(&self, class_name: &str) -> bool {
        self.admin_config_classes.iter().any(|known| known == class_name)
    }

    pub fn is_accessibility_settings_class(&self, class_name: &str) -> bool {
        self.accessibility_settings_classes
            .iter()
            .any(|known| known == class_name)
    }

    /// Activity classes the usage-stats detector never treats as foreground.
    pub fn is_transient_system_class(&self, class_name: &str) -> bool {
        self.is_recents_class(class_name)
            || self.is_admin_config_class(class_name)
            || self.is_accessibility_settings_class(class_name)
    }

    pub fn mentions_app_label(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.app_labels
            .iter()
            .any(|label| lowered.contains(&label.to_lowercase()))
    }

    /// Packages that must be skipped before evaluation: ours, excluded
    /// system packages, and the given input methods.
    pub fn should_skip(&self, package: &str, input_methods: &HashSet<String>) -> bool {
        self.is_self(package) || self.is_excluded(package) || input_methods.contains(package)
    }
}

/// Loads the engine config, returning defaults if the file is missing.
///
/// A malformed file is reported as an error so callers can log it; use
/// [`load_engine_config_or_default`] when any failure should fall back.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(EngineConfig::default())
        }
        Err(source) => {
            return Err(AppLockError::Io {
                context: format!("reading {}", path.display()),
                source,
            })
        }
    };

    serde_json::from_str(&data).map_err(|err| AppLockError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

pub fn load_engine_config_or_default(path: &Path) -> EngineConfig {
    match load_engine_config(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Using default engine config");
            EngineConfig::default()
        }
    }
}

pub fn save_engine_config(path: &Path, config: &EngineConfig) -> Result<()> {
    let payload = serde_json::to_vec_pretty(config).map_err(|source| AppLockError::Json {
        context: "serializing engine config".to_string(),
        source,
    })?;
    write_atomic(path, &payload)
}

/// Writes via a sibling temp file and rename so readers never see a torn
/// file.
pub(crate) fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AppLockError::Io {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|source| AppLockError::Io {
        context: format!("writing {}", tmp_path.display()),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| AppLockError::Io {
        context: format!("committing {}", path.display()),
        source,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage paths
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all App Lock data (default: ~/.applock)
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: home.join(".applock"),
        }
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to engine.json (platform constants and timing).
    pub fn engine_config_file(&self) -> PathBuf {
        self.root.join("engine.json")
    }

    /// Path to registry.json (locked apps and user settings).
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
