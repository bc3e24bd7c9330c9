//! # applock-core
//!
//! Foreground-app detection and lock-state arbitration for App Lock.
//!
//! Three interchangeable detectors (accessibility events, usage-stats
//! polling, a privileged process observer) report which app is in front.
//! A single decision engine turns each report into an overlay command while
//! tracking temporary unlocks, grace windows and biometric prompts.
//!
//! ## Design Principles
//!
//! - **Injected state**: one [`LockState`] per process, shared via `Arc`, no
//!   global statics.
//! - **Platform at the seams**: every device API sits behind a trait
//!   ([`AccessibilityPlatform`], [`UsageStatsSource`],
//!   [`ProcessObserverChannel`], [`OverlayPresenter`], [`LockedAppRegistry`]).
//! - **One consumer**: detectors publish into a channel drained by
//!   [`LockService`], so decisions are made in arrival order.
//! - **Never crash the host**: per-cycle failures are logged and skipped.
//! - **FFI-ready**: [`AppLockCore`] exposes the engine to Kotlin via UniFFI.
//!   Prefer additive public API changes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use applock_core::*;
//!
//! let (sink, rx) = DetectorSink::channel();
//! let engine = Arc::new(LockEngine::new(state, registry.clone(), presenter,
//!     Arc::new(ThreadScheduler), Arc::new(SystemClock), config.clone()));
//! let failover = Arc::new(
//!     FailoverController::new(registry, config.restart.clone(), clock, sink)
//!         .with_detector(accessibility)
//!         .with_detector(usage_stats),
//! );
//! let service = Arc::new(LockService::new(engine, failover, rx));
//! service.start()?;
//! ```

// UniFFI scaffolding for Kotlin bindings
uniffi::setup_scaffolding!();

pub mod anti_tamper;
pub mod clock;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod failover;
pub mod ffi;
pub mod overlay;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod types;

pub use anti_tamper::{detect_tamper, AntiTamperMonitor, GlobalAction, TamperSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use detectors::*;
pub use engine::{decide, LockEngine, RegistryView};
pub use error::{AppLockError, AppLockFfiError, Result};
pub use failover::{fallback_order, FailoverController};
pub use ffi::*;
pub use overlay::{OverlayCommand, OverlayPresenter, RecordingPresenter};
pub use registry::{LockedAppRegistry, MemoryRegistry, RegistryData};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, ThreadScheduler};
pub use service::LockService;
pub use state::{LockState, LockStateSnapshot};
pub use types::*;
