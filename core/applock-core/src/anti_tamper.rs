//! Anti-uninstall protection.
//!
//! While anti-uninstall is enabled, navigating to our entry in the
//! accessibility settings or to the device-admin page that would deactivate
//! us is interrupted with global actions. Only the accessibility backend
//! sees settings windows, so this runs from that detector.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{mentions_device_admin, EngineConfig};
use crate::detectors::accessibility::{AccessibilityEvent, AccessibilityPlatform};
use crate::registry::LockedAppRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalAction {
    Back,
    Home,
    LockScreen,
}

impl std::fmt::Display for GlobalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Back => "back",
            Self::Home => "home",
            Self::LockScreen => "lock_screen",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperSignal {
    /// Our accessibility service's settings entry is on screen.
    AccessibilitySettings,
    /// A device-admin page listing our app while admin is active.
    DeviceAdminRemoval,
}

impl TamperSignal {
    pub fn response(&self) -> &'static [GlobalAction] {
        match self {
            Self::AccessibilitySettings => {
                &[GlobalAction::Back, GlobalAction::Home, GlobalAction::LockScreen]
            }
            Self::DeviceAdminRemoval => &[GlobalAction::Back, GlobalAction::Home],
        }
    }
}

/// Classifies a settings-package event. Pure; the caller decides whether
/// protection is on.
pub fn detect_tamper(
    event: &AccessibilityEvent,
    config: &EngineConfig,
    device_admin_active: bool,
) -> Option<TamperSignal> {
    if event.package.as_deref() != Some(config.settings_package.as_str()) {
        return None;
    }

    let text = event.joined_text();
    if !config.mentions_app_label(&text) {
        return None;
    }

    let class_name = event.class_name.as_deref().unwrap_or_default();
    let lowered = text.to_lowercase();

    if config.is_accessibility_settings_class(class_name) || lowered.contains("accessibility") {
        return Some(TamperSignal::AccessibilitySettings);
    }

    if device_admin_active
        && (config.is_admin_config_class(class_name) || mentions_device_admin(&text))
    {
        return Some(TamperSignal::DeviceAdminRemoval);
    }

    None
}

pub struct AntiTamperMonitor {
    platform: Arc<dyn AccessibilityPlatform>,
    registry: Arc<dyn LockedAppRegistry>,
    config: Arc<EngineConfig>,
}

impl AntiTamperMonitor {
    pub fn new(
        platform: Arc<dyn AccessibilityPlatform>,
        registry: Arc<dyn LockedAppRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            platform,
            registry,
            config,
        }
    }

    /// Inspects one settings event and issues the blocking actions. Action
    /// failures are logged and not retried; the next matching event tries
    /// again.
    pub fn inspect(&self, event: &AccessibilityEvent) -> Option<TamperSignal> {
        if !self.registry.is_anti_uninstall_enabled() {
            return None;
        }

        // Admin state is a binder call, so only ask when the page could matter.
        let admin_active = || self.platform.is_device_admin_active();
        let signal = detect_tamper(event, &self.config, false).or_else(|| {
            if admin_active() {
                detect_tamper(event, &self.config, true)
            } else {
                None
            }
        })?;

        tracing::warn!(signal = ?signal, "Blocking navigation to protection settings");
        for action in signal.response() {
            if let Err(err) = self.platform.perform_global_action(*action) {
                tracing::warn!(action = %action, error = %err, "Global action failed");
            }
        }
        Some(signal)
    }
}
