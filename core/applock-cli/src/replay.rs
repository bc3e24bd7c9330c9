//! Drives the lock engine from a JSON-lines script in virtual time.
//!
//! Each non-blank line is one step:
//!
//! ```text
//! {"step": "settings", "locked_apps": ["com.example.bank"], "unlock_grace_minutes": 5}
//! {"step": "detect", "package": "com.example.bank"}
//! {"step": "submit", "package": "com.example.bank", "secret": "2580"}
//! {"step": "advance", "millis": 3000}
//! {"step": "snapshot"}
//! ```
//!
//! One JSON line is written per step with the decision, any overlay
//! commands it caused, and the virtual time it ran at. Lines starting
//! with `#` are comments.

use applock_core::{
    AppLockError, Clock, Decision, DetectionEvent, DetectionSource, EngineConfig, LockEngine,
    LockState, LockStateSnapshot, ManualClock, ManualScheduler, MemoryRegistry, OverlayCommand,
    RecordingPresenter, RegistryData,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Line {line}: {source}")]
    Step { line: usize, source: AppLockError },

    #[error("Failed to encode output: {0}")]
    Encode(serde_json::Error),
}

fn default_source() -> DetectionSource {
    DetectionSource::Accessibility
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Replaces the registry contents.
    Settings(RegistryData),
    /// The host resolved `package` as the foreground app.
    Detect {
        package: String,
        #[serde(default = "default_source")]
        source: DetectionSource,
        #[serde(default)]
        triggering: Option<String>,
    },
    /// The lock screen accepted a credential for `package`.
    Credential { package: String },
    /// The user typed `secret` into the lock screen.
    Submit { package: String, secret: String },
    BiometricStarted,
    BiometricFinished { success: bool },
    Dismissed,
    Unprotected { package: String },
    /// Moves the virtual clock and runs any due delayed tasks.
    Advance { millis: u64 },
    Snapshot,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Settings(_) => "settings",
            Self::Detect { .. } => "detect",
            Self::Credential { .. } => "credential",
            Self::Submit { .. } => "submit",
            Self::BiometricStarted => "biometric_started",
            Self::BiometricFinished { .. } => "biometric_finished",
            Self::Dismissed => "dismissed",
            Self::Unprotected { .. } => "unprotected",
            Self::Advance { .. } => "advance",
            Self::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub line: usize,
    pub step: &'static str,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlocked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks_run: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<LockStateSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overlay: Vec<OverlayCommand>,
}

impl StepOutput {
    fn new(line: usize, step: &'static str, at: DateTime<Utc>) -> Self {
        Self {
            line,
            step,
            at,
            decision: None,
            accepted: None,
            unlocked: None,
            tasks_run: None,
            snapshot: None,
            overlay: Vec::new(),
        }
    }
}

pub struct Replay {
    engine: LockEngine,
    registry: Arc<MemoryRegistry>,
    presenter: Arc<RecordingPresenter>,
    scheduler: Arc<ManualScheduler>,
    clock: Arc<ManualClock>,
}

impl Replay {
    pub fn new(registry: RegistryData, config: EngineConfig, start: DateTime<Utc>) -> Self {
        let registry = Arc::new(MemoryRegistry::from_data(registry));
        let presenter = Arc::new(RecordingPresenter::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let clock = Arc::new(ManualClock::new(start));
        let engine = LockEngine::new(
            Arc::new(LockState::new()),
            registry.clone(),
            presenter.clone(),
            scheduler.clone(),
            clock.clone(),
            Arc::new(config),
        );
        Self {
            engine,
            registry,
            presenter,
            scheduler,
            clock,
        }
    }

    pub fn apply(&self, line: usize, step: Step) -> Result<StepOutput, ReplayError> {
        let mut output = StepOutput::new(line, step.name(), self.clock.now());

        match step {
            Step::Settings(data) => self.registry.replace(data),
            Step::Detect {
                package,
                source,
                triggering,
            } => {
                if package.trim().is_empty() {
                    return Err(ReplayError::Step {
                        line,
                        source: AppLockError::BlankPackage,
                    });
                }
                let event = DetectionEvent::new(package, self.clock.now(), source)
                    .with_triggering(triggering);
                output.decision = Some(self.engine.process(&event));
            }
            Step::Credential { package } => self.engine.on_credential_accepted(&package),
            Step::Submit { package, secret } => {
                output.accepted = Some(self.engine.submit_credential(&package, &secret));
            }
            Step::BiometricStarted => self.engine.on_biometric_started(),
            Step::BiometricFinished { success } => {
                output.unlocked = self.engine.on_biometric_finished(success);
            }
            Step::Dismissed => self.engine.on_dismissed(),
            Step::Unprotected { package } => self.engine.on_app_unprotected(&package),
            Step::Advance { millis } => {
                self.clock.advance(Duration::milliseconds(millis as i64));
                output.at = self.clock.now();
                output.tasks_run = Some(
                    self.scheduler
                        .advance(std::time::Duration::from_millis(millis)),
                );
            }
            Step::Snapshot => output.snapshot = Some(self.engine.state().snapshot()),
        }

        output.overlay = self.presenter.take_commands();
        Ok(output)
    }

    /// Runs every step in `input`, writing one JSON line per step to
    /// `output`. Returns the number of steps run.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut output: W) -> Result<usize, ReplayError> {
        let mut steps = 0;
        for (index, text) in input.lines().enumerate() {
            let text = text?;
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let line = index + 1;
            let step: Step = serde_json::from_str(trimmed)
                .map_err(|source| ReplayError::Parse { line, source })?;
            tracing::debug!(line, step = step.name(), "Replaying step");

            let result = self.apply(line, step)?;
            serde_json::to_writer(&mut output, &result).map_err(ReplayError::Encode)?;
            writeln!(output)?;
            steps += 1;
        }
        output.flush()?;
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applock_core::LockAction;
    use chrono::TimeZone;

    fn replay(registry: RegistryData) -> Replay {
        Replay::new(
            registry,
            EngineConfig::default(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn locked(grace: u32) -> RegistryData {
        RegistryData {
            locked_apps: ["com.example.bank".to_string()].into_iter().collect(),
            credential: Some("2580".to_string()),
            unlock_grace_minutes: grace,
            ..RegistryData::default()
        }
    }

    fn run(replay: &Replay, script: &str) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        replay.run(script.as_bytes(), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn parses_every_step_kind() {
        let steps = [
            r#"{"step":"settings","locked_apps":["a.b"]}"#,
            r#"{"step":"detect","package":"a.b","source":"usage_stats"}"#,
            r#"{"step":"credential","package":"a.b"}"#,
            r#"{"step":"submit","package":"a.b","secret":"x"}"#,
            r#"{"step":"biometric_started"}"#,
            r#"{"step":"biometric_finished","success":false}"#,
            r#"{"step":"dismissed"}"#,
            r#"{"step":"unprotected","package":"a.b"}"#,
            r#"{"step":"advance","millis":10}"#,
            r#"{"step":"snapshot"}"#,
        ];
        for text in steps {
            let step: Step = serde_json::from_str(text).unwrap();
            assert!(text.contains(step.name()));
        }
    }

    #[test]
    fn detect_defaults_to_accessibility_source() {
        let step: Step = serde_json::from_str(r#"{"step":"detect","package":"a.b"}"#).unwrap();
        assert!(matches!(
            step,
            Step::Detect {
                source: DetectionSource::Accessibility,
                triggering: None,
                ..
            }
        ));
    }

    #[test]
    fn show_submit_then_ignore() {
        let r = replay(locked(0));
        let lines = run(
            &r,
            r#"
            # lock screen round trip
            {"step":"detect","package":"com.example.bank"}
            {"step":"submit","package":"com.example.bank","secret":"2580"}
            {"step":"detect","package":"com.example.bank"}
            "#,
        );

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["decision"]["action"], "show_overlay");
        assert_eq!(lines[0]["overlay"][0]["command"], "show");
        assert_eq!(lines[1]["accepted"], true);
        assert_eq!(lines[2]["decision"]["action"], "ignore");
        assert!(lines[2].get("overlay").is_none());
    }

    #[test]
    fn advance_runs_debounced_home_clear() {
        let r = replay(locked(0));
        r.apply(1, Step::Credential {
            package: "com.example.bank".to_string(),
        })
        .unwrap();

        let lines = run(
            &r,
            r#"{"step":"detect","package":"com.android.launcher3"}
{"step":"advance","millis":3000}
{"step":"detect","package":"com.example.bank"}"#,
        );
        assert_eq!(lines[0]["decision"]["action"], "clear_state");
        assert_eq!(lines[1]["tasks_run"], 1);
        assert_eq!(lines[2]["decision"]["action"], "show_overlay");
    }

    #[test]
    fn settings_step_changes_grace() {
        let r = replay(locked(0));
        r.apply(1, Step::Credential {
            package: "com.example.bank".to_string(),
        })
        .unwrap();
        r.apply(2, Step::Settings(locked(5))).unwrap();
        r.apply(3, Step::Detect {
            package: "com.example.notes".to_string(),
            source: DetectionSource::UsageStats,
            triggering: None,
        })
        .unwrap();
        r.apply(4, Step::Advance { millis: 60_000 }).unwrap();

        let out = r
            .apply(5, Step::Detect {
                package: "com.example.bank".to_string(),
                source: DetectionSource::UsageStats,
                triggering: None,
            })
            .unwrap();
        assert_eq!(
            out.decision.map(|decision| decision.action),
            Some(LockAction::GrantGraceUnlock("com.example.bank".to_string()))
        );
    }

    #[test]
    fn bad_line_reports_its_number() {
        let r = replay(locked(0));
        let mut out = Vec::new();
        let err = r
            .run("\n{\"step\":\"detect\"}\n".as_bytes(), &mut out)
            .unwrap_err();
        assert!(matches!(err, ReplayError::Parse { line: 2, .. }));
    }

    #[test]
    fn blank_package_is_rejected() {
        let r = replay(locked(0));
        let err = r
            .apply(7, Step::Detect {
                package: " ".to_string(),
                source: DetectionSource::Accessibility,
                triggering: None,
            })
            .unwrap_err();
        assert!(matches!(err, ReplayError::Step { line: 7, .. }));
    }

    #[test]
    fn snapshot_reports_state() {
        let r = replay(locked(0));
        r.apply(1, Step::Credential {
            package: "com.example.bank".to_string(),
        })
        .unwrap();
        let out = r.apply(2, Step::Snapshot).unwrap();
        let snapshot = out.snapshot.unwrap();
        assert_eq!(
            snapshot.temporarily_unlocked_package.as_deref(),
            Some("com.example.bank")
        );
    }
}
