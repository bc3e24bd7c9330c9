//! Locked-app registry: which packages are protected and the user settings
//! that steer every decision cycle.
//!
//! The host owns the real preference store. The engine only sees the
//! [`LockedAppRegistry`] trait, read once per detection event. A
//! [`MemoryRegistry`] is provided for the FFI layer (which pushes snapshots
//! from the host), the CLI and tests.

use fs_err as fs;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::write_atomic;
use crate::error::{AppLockError, Result};
use crate::types::{BackendChoice, PackageId};

pub trait LockedAppRegistry: Send + Sync {
    fn locked_apps(&self) -> BTreeSet<PackageId>;
    fn trigger_excluded_apps(&self) -> BTreeSet<PackageId>;
    fn is_anti_uninstall_enabled(&self) -> bool;
    /// Zero disables the grace window.
    fn unlock_grace_minutes(&self) -> u32;
    fn chosen_backend(&self) -> BackendChoice;
    fn fallback_backend(&self) -> BackendChoice;
    fn is_protect_enabled(&self) -> bool;
    fn is_biometric_enabled(&self) -> bool;
    fn validate_credential(&self, secret: &str) -> bool;

    fn is_locked(&self, package: &str) -> bool {
        self.locked_apps().contains(package)
    }

    fn is_trigger_excluded(&self, package: &str) -> bool {
        self.trigger_excluded_apps().contains(package)
    }
}

/// Serializable registry contents, as persisted to `registry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryData {
    pub locked_apps: BTreeSet<PackageId>,
    pub trigger_excluded_apps: BTreeSet<PackageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub biometric_enabled: bool,
    pub anti_uninstall_enabled: bool,
    pub unlock_grace_minutes: u32,
    #[serde(deserialize_with = "backend_from_id")]
    pub chosen_backend: BackendChoice,
    #[serde(deserialize_with = "backend_from_id")]
    pub fallback_backend: BackendChoice,
    pub protect_enabled: bool,
}

/// Stored backend ids are matched leniently; unknown ids load as
/// accessibility.
fn backend_from_id<'de, D>(deserializer: D) -> std::result::Result<BackendChoice, D::Error>
where
    D: Deserializer<'de>,
{
    let id = String::deserialize(deserializer)?;
    Ok(BackendChoice::from_id(&id))
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            locked_apps: BTreeSet::new(),
            trigger_excluded_apps: BTreeSet::new(),
            credential: None,
            biometric_enabled: false,
            anti_uninstall_enabled: false,
            unlock_grace_minutes: 0,
            chosen_backend: BackendChoice::Accessibility,
            fallback_backend: BackendChoice::Accessibility,
            protect_enabled: true,
        }
    }
}

impl RegistryData {
    /// Drops blank package names that a hand-edited file may contain.
    fn sanitized(mut self) -> Self {
        self.locked_apps.retain(|pkg| !pkg.trim().is_empty());
        self.trigger_excluded_apps.retain(|pkg| !pkg.trim().is_empty());
        self
    }

    /// Loads registry data, returning an empty registry if the file is
    /// missing.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(source) => {
                return Err(AppLockError::Io {
                    context: format!("reading {}", path.display()),
                    source,
                })
            }
        };

        let parsed: Self = serde_json::from_slice(&data).map_err(|source| AppLockError::Json {
            context: format!("parsing {}", path.display()),
            source,
        })?;
        Ok(parsed.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).map_err(|source| AppLockError::Json {
            context: "serializing registry".to_string(),
            source,
        })?;
        write_atomic(path, &payload)
    }
}

fn normalize_package(package: &str) -> Result<PackageId> {
    let trimmed = package.trim();
    if trimmed.is_empty() {
        return Err(AppLockError::BlankPackage);
    }
    Ok(trimmed.to_string())
}

/// In-process registry guarded by an `RwLock`; reads vastly outnumber
/// writes.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    data: RwLock<RegistryData>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: RegistryData) -> Self {
        Self {
            data: RwLock::new(data.sanitized()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        RegistryData::load(path).map(Self::from_data)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.read().save(path)
    }

    pub fn snapshot(&self) -> RegistryData {
        self.read().clone()
    }

    pub fn replace(&self, data: RegistryData) {
        *self.write() = data.sanitized();
    }

    pub fn lock_app(&self, package: &str) -> Result<()> {
        let package = normalize_package(package)?;
        self.write().locked_apps.insert(package);
        Ok(())
    }

    /// Returns whether the package had been locked.
    pub fn unlock_app(&self, package: &str) -> bool {
        self.write().locked_apps.remove(package.trim())
    }

    pub fn add_trigger_exclusion(&self, package: &str) -> Result<()> {
        let package = normalize_package(package)?;
        self.write().trigger_excluded_apps.insert(package);
        Ok(())
    }

    pub fn remove_trigger_exclusion(&self, package: &str) -> bool {
        self.write().trigger_excluded_apps.remove(package.trim())
    }

    pub fn set_credential(&self, secret: impl Into<String>) {
        self.write().credential = Some(secret.into());
    }

    pub fn set_unlock_grace_minutes(&self, minutes: u32) {
        self.write().unlock_grace_minutes = minutes;
    }

    pub fn set_biometric_enabled(&self, enabled: bool) {
        self.write().biometric_enabled = enabled;
    }

    pub fn set_anti_uninstall_enabled(&self, enabled: bool) {
        self.write().anti_uninstall_enabled = enabled;
    }

    pub fn set_protect_enabled(&self, enabled: bool) {
        self.write().protect_enabled = enabled;
    }

    pub fn set_chosen_backend(&self, backend: BackendChoice) {
        self.write().chosen_backend = backend;
    }

    pub fn set_fallback_backend(&self, backend: BackendChoice) {
        self.write().fallback_backend = backend;
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryData> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryData> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockedAppRegistry for MemoryRegistry {
    fn locked_apps(&self) -> BTreeSet<PackageId> {
        self.read().locked_apps.clone()
    }

    fn trigger_excluded_apps(&self) -> BTreeSet<PackageId> {
        self.read().trigger_excluded_apps.clone()
    }

    fn is_anti_uninstall_enabled(&self) -> bool {
        self.read().anti_uninstall_enabled
    }

    fn unlock_grace_minutes(&self) -> u32 {
        self.read().unlock_grace_minutes
    }

    fn chosen_backend(&self) -> BackendChoice {
        self.read().chosen_backend
    }

    fn fallback_backend(&self) -> BackendChoice {
        self.read().fallback_backend
    }

    fn is_protect_enabled(&self) -> bool {
        self.read().protect_enabled
    }

    fn is_biometric_enabled(&self) -> bool {
        self.read().biometric_enabled
    }

    fn validate_credential(&self, secret: &str) -> bool {
        match self.read().credential.as_deref() {
            Some(expected) => !secret.is_empty() && expected == secret,
            None => false,
        }
    }

    // Avoid cloning the whole set on the hot path.
    fn is_locked(&self, package: &str) -> bool {
        self.read().locked_apps.contains(package)
    }

    fn is_trigger_excluded(&self, package: &str) -> bool {
        self.read().trigger_excluded_apps.contains(package)
    }
}
