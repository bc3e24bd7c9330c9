//! Detector -> channel -> LockService -> engine, with failover between real
//! detector implementations over fake platform sources.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use applock_core::{
    AccessibilityDetector, AccessibilityEvent, AccessibilityPlatform, AppLockError, BackendChoice,
    Clock, DetectionSource, DetectorSink, EngineConfig, FailoverController, ForegroundDetector,
    GlobalAction, LockAction, LockEngine, LockService, LockState, ManualClock, ManualScheduler,
    MemoryRegistry, PackageId, ProcessObserverChannel, ProcessObserverDetector,
    ProcessStateListener, RecordingPresenter, ResumedActivity, Result, UsageSnapshotEntry,
    UsageStatsDetector, UsageStatsSource,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

const LOCKED: &str = "com.example.bank";
const OTHER: &str = "com.example.notes";

#[derive(Default)]
struct FakeAccessibility {
    disabled: AtomicBool,
    actions: Mutex<Vec<GlobalAction>>,
}

impl AccessibilityPlatform for FakeAccessibility {
    fn is_service_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }
    fn is_keyguard_active(&self) -> bool {
        false
    }
    fn input_method_packages(&self) -> HashSet<PackageId> {
        HashSet::new()
    }
    fn default_launcher(&self) -> Option<PackageId> {
        Some("com.vendor.home".to_string())
    }
    fn is_device_admin_active(&self) -> bool {
        false
    }
    fn perform_global_action(&self, action: GlobalAction) -> Result<()> {
        self.actions.lock().unwrap().push(action);
        Ok(())
    }
}

#[derive(Default)]
struct FakeUsage {
    denied: AtomicBool,
    resumed: Mutex<Vec<ResumedActivity>>,
}

impl UsageStatsSource for FakeUsage {
    fn has_permission(&self) -> bool {
        !self.denied.load(Ordering::SeqCst)
    }
    fn is_device_locked(&self) -> bool {
        false
    }
    fn input_method_packages(&self) -> HashSet<PackageId> {
        HashSet::new()
    }
    fn resumed_activities(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<ResumedActivity>> {
        Ok(self.resumed.lock().unwrap().clone())
    }
    fn usage_snapshot(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshotEntry>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeObserver {
    unavailable: AtomicBool,
    listener: Mutex<Option<Arc<dyn ProcessStateListener>>>,
    uids: HashMap<u32, PackageId>,
}

impl FakeObserver {
    fn new() -> Self {
        Self {
            uids: [(10_001, LOCKED), (10_002, OTHER)]
                .into_iter()
                .map(|(uid, pkg)| (uid, pkg.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn listener(&self) -> Arc<dyn ProcessStateListener> {
        self.listener.lock().unwrap().clone().expect("registered")
    }
}

impl ProcessObserverChannel for FakeObserver {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
    fn register(&self, listener: Arc<dyn ProcessStateListener>) -> Result<u64> {
        *self.listener.lock().unwrap() = Some(listener);
        Ok(1)
    }
    fn unregister(&self, _token: u64) {
        self.listener.lock().unwrap().take();
    }
    fn package_for_uid(&self, uid: u32) -> Option<PackageId> {
        self.uids.get(&uid).cloned()
    }
}

struct Pipeline {
    service: Arc<LockService>,
    presenter: Arc<RecordingPresenter>,
    clock: Arc<ManualClock>,
    registry: Arc<MemoryRegistry>,
    accessibility_platform: Arc<FakeAccessibility>,
    accessibility: Arc<AccessibilityDetector>,
    usage: Arc<UsageStatsDetector>,
    usage_source: Arc<FakeUsage>,
    observer: Arc<FakeObserver>,
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().expect("valid timestamp")
}

fn pipeline(chosen: BackendChoice) -> Pipeline {
    let registry = Arc::new(MemoryRegistry::new());
    registry.lock_app(LOCKED).unwrap();
    registry.set_chosen_backend(chosen);

    let config = Arc::new(EngineConfig::default());
    let state = Arc::new(LockState::new());
    let clock = Arc::new(ManualClock::new(at(100_000)));
    let presenter = Arc::new(RecordingPresenter::new());

    let accessibility_platform = Arc::new(FakeAccessibility::default());
    let accessibility = Arc::new(AccessibilityDetector::new(
        accessibility_platform.clone(),
        registry.clone(),
        Arc::clone(&state),
        Arc::clone(&config),
    ));
    let usage_source = Arc::new(FakeUsage::default());
    let usage = Arc::new(UsageStatsDetector::new(
        usage_source.clone(),
        registry.clone(),
        Arc::clone(&state),
        Arc::clone(&config),
        clock.clone(),
    ));
    let observer = Arc::new(FakeObserver::new());
    let observer_detector = Arc::new(ProcessObserverDetector::new(
        observer.clone(),
        Arc::clone(&config),
        clock.clone(),
    ));

    let (sink, rx) = DetectorSink::channel();
    let failover = FailoverController::new(
        registry.clone(),
        config.restart.clone(),
        clock.clone(),
        sink,
    )
    .with_detector(accessibility.clone())
    .with_detector(usage.clone())
    .with_detector(observer_detector);

    let engine = LockEngine::new(
        state,
        registry.clone(),
        presenter.clone(),
        Arc::new(ManualScheduler::new()),
        clock.clone(),
        config,
    );
    let service = Arc::new(LockService::new(Arc::new(engine), Arc::new(failover), rx));

    Pipeline {
        service,
        presenter,
        clock,
        registry,
        accessibility_platform,
        accessibility,
        usage,
        usage_source,
        observer,
    }
}

#[test]
fn observer_callback_reaches_overlay() {
    let p = pipeline(BackendChoice::ProcessObserver);
    assert_eq!(
        p.service.failover().start().unwrap(),
        BackendChoice::ProcessObserver
    );

    p.observer.listener().on_foreground_activities_changed(42, 10_001, true);
    let decisions = p.service.pump();

    assert_eq!(decisions.len(), 1);
    assert_eq!(
        decisions[0].action,
        LockAction::ShowOverlay(LOCKED.to_string())
    );
    assert_eq!(p.presenter.show_count(), 1);
}

#[test]
fn binder_death_fails_over_to_usage_stats() {
    let p = pipeline(BackendChoice::ProcessObserver);
    p.service.failover().start().unwrap();

    p.observer.listener().on_binder_died();
    p.service.pump();

    assert_eq!(
        p.service.failover().active_backend(),
        Some(BackendChoice::UsageStats)
    );
    assert!(p.usage.is_running());
    assert!(p.accessibility.is_running());
    p.service.shutdown();
    assert!(!p.usage.is_running());
    assert!(!p.accessibility.is_running());
}

#[test]
fn accessibility_events_defer_to_fallback_after_primary_dies() {
    let p = pipeline(BackendChoice::ProcessObserver);
    p.service.failover().start().unwrap();
    p.observer.listener().on_binder_died();
    p.service.pump();
    assert_eq!(
        p.service.failover().active_backend(),
        Some(BackendChoice::UsageStats)
    );

    p.accessibility
        .on_event(&AccessibilityEvent::window_state(LOCKED, at(1)));
    assert!(p.service.pump().is_empty());
    assert_eq!(p.presenter.show_count(), 0);
    p.service.shutdown();
}

#[test]
fn anti_tamper_runs_with_usage_stats_chosen() {
    let p = pipeline(BackendChoice::UsageStats);
    p.registry.set_anti_uninstall_enabled(true);

    assert_eq!(
        p.service.failover().start().unwrap(),
        BackendChoice::UsageStats
    );
    assert!(p.accessibility.is_running());

    p.accessibility.on_event(
        &AccessibilityEvent::window_state("com.android.settings", at(1))
            .with_class("com.android.settings.accessibility.AccessibilitySettings")
            .with_text("App Lock"),
    );
    assert_eq!(
        *p.accessibility_platform.actions.lock().unwrap(),
        vec![GlobalAction::Back, GlobalAction::Home, GlobalAction::LockScreen]
    );
    assert_eq!(
        p.service.failover().active_backend(),
        Some(BackendChoice::UsageStats)
    );
    p.service.shutdown();
}

#[test]
fn unavailable_observer_starts_usage_stats_and_its_events_count() {
    let p = pipeline(BackendChoice::ProcessObserver);
    p.observer.unavailable.store(true, Ordering::SeqCst);
    *p.usage_source.resumed.lock().unwrap() = vec![ResumedActivity {
        package: LOCKED.to_string(),
        class_name: None,
        timestamp: p.clock.now() - Duration::milliseconds(300),
    }];

    assert_eq!(
        p.service.failover().start().unwrap(),
        BackendChoice::UsageStats
    );

    // The primary is not running, so the fallback's poll is evaluated.
    let decisions = pump_until_decision(&p);
    assert_eq!(decisions[0].action, LockAction::ShowOverlay(LOCKED.to_string()));
    p.service.shutdown();
}

#[test]
fn fallback_events_defer_to_running_primary() {
    let p = pipeline(BackendChoice::ProcessObserver);
    p.service.failover().start().unwrap();
    assert!(p.accessibility.is_running());

    let event = applock_core::DetectionEvent::new(LOCKED, at(1), DetectionSource::Accessibility);
    assert!(p
        .service
        .dispatch(applock_core::DetectorMessage::Detected(event))
        .is_none());
    assert_eq!(p.presenter.show_count(), 0);
}

#[test]
fn accessibility_launcher_is_registered_with_engine() {
    let p = pipeline(BackendChoice::Accessibility);
    p.service.failover().start().unwrap();
    p.service.pump();
    assert!(p.service.engine().is_launcher("com.vendor.home"));

    p.accessibility
        .on_event(&AccessibilityEvent::window_state("com.vendor.home", at(5)));
    let decisions = p.service.pump();
    assert_eq!(decisions[0].action, LockAction::ClearState);
}

#[test]
fn accessibility_failure_has_nowhere_to_go() {
    let p = pipeline(BackendChoice::UsageStats);
    p.usage_source.denied.store(true, Ordering::SeqCst);

    assert_eq!(
        p.service.failover().start().unwrap(),
        BackendChoice::Accessibility
    );
    p.service.shutdown();
    assert!(matches!(
        p.service
            .failover()
            .on_backend_failed(BackendChoice::Accessibility, "service disabled"),
        Err(AppLockError::NoFallbackAvailable(BackendChoice::Accessibility))
    ));
}

#[test]
fn worker_thread_processes_messages() {
    let p = pipeline(BackendChoice::ProcessObserver);
    assert_eq!(p.service.start().unwrap(), BackendChoice::ProcessObserver);

    p.observer.listener().on_foreground_activities_changed(7, 10_001, true);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while p.presenter.show_count() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(p.presenter.show_count(), 1);
    p.service.shutdown();
}

fn pump_until_decision(p: &Pipeline) -> Vec<applock_core::Decision> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let decisions = p.service.pump();
        if !decisions.is_empty() || std::time::Instant::now() >= deadline {
            return decisions;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
