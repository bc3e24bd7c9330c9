//! Process-wide lock state shared by every detector and the decision engine.
//!
//! One `LockState` is constructed by the host and handed out as
//! `Arc<LockState>`. During a failover transition two detectors may touch it
//! at once, so every field is independently synchronized:
//!
//! - flags (`overlay_visible`, biometric phase, generation) are atomics
//! - the unlock-timestamp table sits behind an `RwLock`
//! - the temporarily-unlocked package and overlay package use short `Mutex`
//!   critical sections
//!
//! There are no multi-field transactions. The decision engine tolerates a
//! slightly stale read because detection is continuous and the next cycle
//! corrects it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::types::{BiometricPhase, PackageId};

const PHASE_IDLE: u8 = 0;
const PHASE_AUTH_IN_PROGRESS: u8 = 1;

#[derive(Debug, Default)]
pub struct LockState {
    temporarily_unlocked: Mutex<Option<PackageId>>,
    unlock_timestamps: RwLock<HashMap<PackageId, DateTime<Utc>>>,
    biometric_phase: AtomicU8,
    overlay_visible: AtomicBool,
    overlay_package: Mutex<Option<PackageId>>,
    generation: AtomicU64,
}

/// Point-in-time copy of [`LockState`] for logging, FFI and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStateSnapshot {
    pub temporarily_unlocked_package: Option<PackageId>,
    pub unlock_timestamps: HashMap<PackageId, DateTime<Utc>>,
    pub biometric_phase: BiometricPhase,
    pub overlay_visible: bool,
    pub overlay_package: Option<PackageId>,
    pub generation: u64,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Temporary unlock
    // ─────────────────────────────────────────────────────────────────────

    pub fn temporarily_unlocked_package(&self) -> Option<PackageId> {
        lock(&self.temporarily_unlocked).clone()
    }

    pub fn is_temporarily_unlocked(&self, package: &str) -> bool {
        lock(&self.temporarily_unlocked).as_deref() == Some(package)
    }

    /// Replaces whatever was unlocked before; only one package is ever
    /// exempt at a time.
    pub fn set_temporarily_unlocked(&self, package: &str) {
        *lock(&self.temporarily_unlocked) = Some(package.to_string());
    }

    pub fn clear_temporarily_unlocked(&self) -> Option<PackageId> {
        lock(&self.temporarily_unlocked).take()
    }

    /// Clears the temporary unlock only if it still names `package`.
    /// Returns whether anything was cleared.
    pub fn clear_temporarily_unlocked_if(&self, package: &str) -> bool {
        let mut current = lock(&self.temporarily_unlocked);
        if current.as_deref() == Some(package) {
            *current = None;
            true
        } else {
            false
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Unlock timestamps
    // ─────────────────────────────────────────────────────────────────────

    pub fn unlock_timestamp(&self, package: &str) -> Option<DateTime<Utc>> {
        self.unlock_timestamps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(package)
            .copied()
    }

    pub fn record_unlock(&self, package: &str, at: DateTime<Utc>) {
        self.unlock_timestamps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(package.to_string(), at);
    }

    pub fn remove_unlock_timestamp(&self, package: &str) -> Option<DateTime<Utc>> {
        self.unlock_timestamps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(package)
    }

    pub fn clear_unlock_timestamps(&self) {
        self.unlock_timestamps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Successful authentication for `package`: it becomes the single
    /// temporarily unlocked package and its grace window starts at `at`.
    pub fn unlock(&self, package: &str, at: DateTime<Utc>) {
        self.set_temporarily_unlocked(package);
        self.record_unlock(package, at);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Biometric phase
    // ─────────────────────────────────────────────────────────────────────

    pub fn biometric_phase(&self) -> BiometricPhase {
        match self.biometric_phase.load(Ordering::SeqCst) {
            PHASE_AUTH_IN_PROGRESS => BiometricPhase::AuthInProgress,
            _ => BiometricPhase::Idle,
        }
    }

    pub fn set_biometric_phase(&self, phase: BiometricPhase) {
        let raw = match phase {
            BiometricPhase::Idle => PHASE_IDLE,
            BiometricPhase::AuthInProgress => PHASE_AUTH_IN_PROGRESS,
        };
        self.biometric_phase.store(raw, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Overlay
    // ─────────────────────────────────────────────────────────────────────

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible.load(Ordering::SeqCst)
    }

    pub fn overlay_package(&self) -> Option<PackageId> {
        lock(&self.overlay_package).clone()
    }

    pub fn mark_overlay_shown(&self, package: &str) {
        *lock(&self.overlay_package) = Some(package.to_string());
        self.overlay_visible.store(true, Ordering::SeqCst);
    }

    /// Returns the package the overlay had been raised for, if any.
    pub fn mark_overlay_hidden(&self) -> Option<PackageId> {
        self.overlay_visible.store(false, Ordering::SeqCst);
        lock(&self.overlay_package).take()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Generation
    // ─────────────────────────────────────────────────────────────────────

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Bumped once per detection event. Returns the new generation.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> LockStateSnapshot {
        LockStateSnapshot {
            temporarily_unlocked_package: self.temporarily_unlocked_package(),
            unlock_timestamps: self
                .unlock_timestamps
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            biometric_phase: self.biometric_phase(),
            overlay_visible: self.overlay_visible(),
            overlay_package: self.overlay_package(),
            generation: self.generation(),
        }
    }
}

// A poisoned lock still holds a valid value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
