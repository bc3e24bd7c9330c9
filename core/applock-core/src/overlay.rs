//! Overlay presenter seam.
//!
//! The host implements [`OverlayPresenter`] by launching (or re-fronting)
//! the lock screen. Results of the lock screen come back through
//! [`crate::engine::LockEngine`]'s auth callbacks, not through this trait.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{AppLockError, Result};
use crate::types::PackageId;

pub trait OverlayPresenter: Send + Sync {
    /// Raises the lock overlay over `package`. Fire-and-forget: `Ok` means
    /// the launch was accepted, not that the user saw it.
    fn show_overlay(&self, package: &str, triggering: Option<&str>) -> Result<()>;

    /// Brings an already-visible overlay back to the front.
    fn refresh_overlay(&self, package: &str) -> Result<()>;
}

/// A command issued to the presenter, as recorded by [`RecordingPresenter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OverlayCommand {
    Show {
        package: PackageId,
        #[serde(skip_serializing_if = "Option::is_none")]
        triggering: Option<PackageId>,
    },
    Refresh {
        package: PackageId,
    },
}

/// Presenter that records commands instead of drawing anything. Used by the
/// replay CLI and tests.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    commands: Mutex<Vec<OverlayCommand>>,
    reject_shows: AtomicBool,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `show_overlay` calls fail, as a blocked activity
    /// launch would.
    pub fn set_reject_shows(&self, reject: bool) {
        self.reject_shows.store(reject, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<OverlayCommand> {
        self.lock().clone()
    }

    pub fn take_commands(&self) -> Vec<OverlayCommand> {
        std::mem::take(&mut *self.lock())
    }

    pub fn show_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|command| matches!(command, OverlayCommand::Show { .. }))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OverlayCommand>> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OverlayPresenter for RecordingPresenter {
    fn show_overlay(&self, package: &str, triggering: Option<&str>) -> Result<()> {
        if self.reject_shows.load(Ordering::SeqCst) {
            return Err(AppLockError::OverlayLaunchFailed {
                package: package.to_string(),
                details: "launch rejected".to_string(),
            });
        }
        self.lock().push(OverlayCommand::Show {
            package: package.to_string(),
            triggering: triggering.map(str::to_string),
        });
        Ok(())
    }

    fn refresh_overlay(&self, package: &str) -> Result<()> {
        self.lock().push(OverlayCommand::Refresh {
            package: package.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_commands_in_order() {
        let presenter = RecordingPresenter::new();
        presenter.show_overlay("com.a", Some("com.b")).unwrap();
        presenter.refresh_overlay("com.a").unwrap();

        assert_eq!(presenter.show_count(), 1);
        assert_eq!(
            presenter.take_commands(),
            vec![
                OverlayCommand::Show {
                    package: "com.a".to_string(),
                    triggering: Some("com.b".to_string()),
                },
                OverlayCommand::Refresh {
                    package: "com.a".to_string(),
                },
            ]
        );
        assert!(presenter.commands().is_empty());
    }

    #[test]
    fn rejected_show_is_not_recorded() {
        let presenter = RecordingPresenter::new();
        presenter.set_reject_shows(true);
        assert!(presenter.show_overlay("com.a", None).is_err());
        assert_eq!(presenter.show_count(), 0);
    }
}
