//! Error types for applock-core operations.
//! Keep AppLockFfiError minimal and stable to avoid breaking the Kotlin host.

use crate::types::BackendChoice;
use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// FFI-Compatible Error (for Kotlin)
// ═══════════════════════════════════════════════════════════════════════════════

/// FFI-safe error type for use across language boundaries.
///
/// Carries only a message string so it maps cleanly onto UniFFI's error
/// handling.
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum AppLockFfiError {
    #[error("{message}")]
    General { message: String },
}

impl From<String> for AppLockFfiError {
    fn from(message: String) -> Self {
        AppLockFfiError::General { message }
    }
}

impl From<&str> for AppLockFfiError {
    fn from(message: &str) -> Self {
        AppLockFfiError::General {
            message: message.to_string(),
        }
    }
}

impl From<AppLockError> for AppLockFfiError {
    fn from(err: AppLockError) -> Self {
        AppLockFfiError::General {
            message: err.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Error (for Rust-only use)
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in applock-core operations.
///
/// None of these are fatal to the hosting process: detectors and the
/// failover controller log them and recover locally.
#[derive(Debug, thiserror::Error)]
pub enum AppLockError {
    // ─────────────────────────────────────────────────────────────────────
    // Backend Availability
    // ─────────────────────────────────────────────────────────────────────
    #[error("{backend} backend lacks its required permission")]
    PermissionUnavailable { backend: BackendChoice },

    #[error("{backend} backend failed to register with the platform: {details}")]
    RegistrationFailed {
        backend: BackendChoice,
        details: String,
    },

    #[error("{backend} backend is already running")]
    AlreadyRunning { backend: BackendChoice },

    #[error("No detector installed for the {0} backend")]
    DetectorMissing(BackendChoice),

    #[error("No fallback backend could be started after {0} failed")]
    NoFallbackAvailable(BackendChoice),

    // ─────────────────────────────────────────────────────────────────────
    // Platform Calls
    // ─────────────────────────────────────────────────────────────────────
    #[error("Platform query failed: {0}")]
    QueryFailed(String),

    #[error("Overlay launch rejected for {package}: {details}")]
    OverlayLaunchFailed { package: String, details: String },

    #[error("Global action {action} failed: {details}")]
    GlobalActionFailed { action: String, details: String },

    #[error("Failed to spawn worker thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Registry / Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("Package name must not be blank")]
    BlankPackage,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using AppLockError.
pub type Result<T> = std::result::Result<T, AppLockError>;

impl From<AppLockError> for String {
    fn from(err: AppLockError) -> String {
        err.to_string()
    }
}
